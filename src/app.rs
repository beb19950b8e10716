use std::io::Write;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use crate::engine::LocalEngine;
use crate::models::Role;
use crate::services::chat::{
    CycleEvent, CycleOutcome, Phase, Rejection, CANCELLED_NOTICE, FAILURE_NOTICE,
};
use crate::services::export::export_to_markdown;
use crate::services::{AppSettings, ChatController, HistoryStore, KeyValueStore, SettingsService};

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Submit(&'a str),
    Stop,
    Clear,
    History,
    Recall(usize),
    Export(&'a str),
    Model(&'a str),
    Help,
    Quit,
    Unknown(&'a str),
}

fn parse_command(line: &str) -> Command<'_> {
    let Some(rest) = line.trim().strip_prefix('/') else {
        return Command::Submit(line);
    };

    let (name, arg) = match rest.split_once(char::is_whitespace) {
        Some((name, arg)) => (name, arg.trim()),
        None => (rest, ""),
    };

    match name {
        "stop" => Command::Stop,
        "clear" | "new" => Command::Clear,
        "history" => Command::History,
        "recall" => match arg.parse() {
            Ok(n) if n > 0 => Command::Recall(n),
            _ => Command::Unknown(line.trim()),
        },
        "export" if !arg.is_empty() => Command::Export(arg),
        "model" if !arg.is_empty() => Command::Model(arg),
        "help" => Command::Help,
        "quit" | "exit" => Command::Quit,
        _ => Command::Unknown(line.trim()),
    }
}

const HELP: &str = "\
Type a message and press Enter to send it.
  /stop          stop the reply being generated (or Ctrl-C)
  /clear         start a new chat, deleting the history
  /history       list earlier prompts
  /recall N      put prompt N from /history back in the input;
                 press Enter on an empty line to send it
  /export PATH   write the conversation as Markdown
  /model NAME    use another model from the next start
  /quit          leave";

pub struct App {
    store: Arc<dyn KeyValueStore>,
    settings: AppSettings,
    controller: Arc<ChatController>,
    cycle: Option<JoinHandle<()>>,
}

impl App {
    pub fn new(store: Arc<dyn KeyValueStore>, settings: AppSettings) -> Self {
        let history = Arc::new(HistoryStore::load(store.clone()));
        let controller = Arc::new(ChatController::new(history, &settings));
        Self {
            store,
            settings,
            controller,
            cycle: None,
        }
    }

    pub async fn run(mut self) -> Result<()> {
        self.print_history();
        self.connect_engine();

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line.context("Failed to read input")? else {
                        break;
                    };
                    if !self.handle_line(&line) {
                        break;
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    if !self.controller.stop() {
                        break;
                    }
                }
            }
        }

        self.controller.stop();
        if let Some(cycle) = self.cycle.take() {
            let _ = cycle.await;
        }
        Ok(())
    }

    fn print_history(&self) {
        let history = self.controller.history();
        if history.is_empty() {
            println!("New chat. /help lists commands.\n");
        }
        for message in history.messages() {
            let label = match message.role {
                Role::User => "you",
                Role::Assistant => "assistant",
            };
            println!("[{}] {}\n", label, message.content);
        }
    }

    fn connect_engine(&self) {
        let controller = self.controller.clone();
        let settings = self.settings.clone();
        tokio::spawn(async move {
            match LocalEngine::connect(&settings, |status| eprintln!("{}", status)).await {
                Ok(engine) => controller.attach_engine(Arc::new(engine)),
                Err(e) => {
                    tracing::error!("Failed to connect to engine: {}", e);
                    eprintln!("Could not reach {}: {}", settings.base_url, e);
                }
            }
        });
    }

    /// Handle one input line. Returns `false` when the user asked to quit.
    /// A failing command is reported and the session carries on.
    fn handle_line(&mut self, line: &str) -> bool {
        match self.run_command(parse_command(line)) {
            Ok(keep_going) => keep_going,
            Err(e) => {
                tracing::error!("Command failed: {:#}", e);
                eprintln!("{:#}", e);
                true
            }
        }
    }

    fn run_command(&mut self, command: Command<'_>) -> Result<bool> {
        match command {
            Command::Submit(text) => {
                // An empty line sends whatever /recall left in the input
                if !text.trim().is_empty() {
                    self.controller.set_input(text);
                }
                self.start_cycle();
            }
            Command::Stop => {
                if !self.controller.stop() {
                    println!("Nothing is being generated.");
                }
            }
            Command::Clear => {
                self.controller.history().clear()?;
                println!("Started a new chat.");
            }
            Command::History => {
                for (i, prompt) in self.controller.history().user_prompts().iter().enumerate() {
                    println!("{:>3}  {}", i + 1, prompt.content);
                }
            }
            Command::Recall(n) => match self.controller.history().user_prompts().get(n - 1) {
                Some(prompt) => {
                    self.controller.set_input(prompt.content.clone());
                    println!("{}", prompt.content);
                    println!("(press Enter to send, or type a new message)");
                }
                None => println!("No prompt #{}.", n),
            },
            Command::Export(path) => {
                let markdown =
                    export_to_markdown(&self.settings.model, &self.controller.history().messages());
                std::fs::write(path, markdown)
                    .with_context(|| format!("Failed to write {}", path))?;
                println!("Saved to {}.", path);
            }
            Command::Model(model) => {
                let mut settings = SettingsService::load(self.store.as_ref());
                settings.model = model.to_string();
                SettingsService::save(self.store.as_ref(), &settings)?;
                println!("Model set to {}; restart to load it.", model);
            }
            Command::Help => println!("{}", HELP),
            Command::Quit => return Ok(false),
            Command::Unknown(command) => println!("Unknown command {}. Try /help.", command),
        }
        Ok(true)
    }

    fn start_cycle(&mut self) {
        if !self.controller.can_submit() {
            if !self.controller.has_engine() {
                println!("The model is still loading.");
            } else if self.controller.phase() != Phase::Idle {
                println!("Still answering; /stop first.");
            }
            return;
        }

        let controller = self.controller.clone();
        self.cycle = Some(tokio::spawn(async move {
            let mut printed = 0;
            let result = controller
                .submit(|event| {
                    if let CycleEvent::Token { accumulated } = event {
                        let mut stdout = std::io::stdout().lock();
                        let _ = write!(stdout, "{}", &accumulated[printed..]);
                        let _ = stdout.flush();
                        printed = accumulated.len();
                    }
                })
                .await;

            match result {
                Ok(CycleOutcome::Completed { .. }) => println!("\n"),
                Ok(CycleOutcome::Cancelled) => println!("\n[{}]\n", CANCELLED_NOTICE),
                Ok(CycleOutcome::Failed { .. }) => println!("\n{}\n", FAILURE_NOTICE),
                Ok(CycleOutcome::Rejected(Rejection::EngineUnavailable)) => {
                    println!("The model is still loading.")
                }
                Ok(CycleOutcome::Rejected(Rejection::Busy)) => println!("Still answering."),
                Ok(CycleOutcome::Rejected(Rejection::EmptyInput)) => {}
                Err(e) => {
                    tracing::error!("Chat history could not be saved: {}", e);
                    eprintln!("Chat history could not be saved: {}", e);
                }
            }
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NewMessage;
    use crate::services::storage::MemoryStore;

    fn app() -> App {
        App::new(Arc::new(MemoryStore::new()), AppSettings::default())
    }

    #[test]
    fn test_failed_export_keeps_session_running() {
        let mut app = app();
        app.controller
            .history()
            .append(NewMessage::user("Hello"))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("chat.md");
        let line = format!("/export {}", path.display());

        assert!(app.handle_line(&line));
        assert!(!path.exists());
        assert_eq!(app.controller.history().len(), 1);
    }

    #[test]
    fn test_export_writes_transcript() {
        let mut app = app();
        app.controller
            .history()
            .append(NewMessage::user("Hello"))
            .unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chat.md");

        assert!(app.handle_line(&format!("/export {}", path.display())));
        let markdown = std::fs::read_to_string(&path).unwrap();
        assert!(markdown.contains("### You\n\nHello"));
    }

    #[test]
    fn test_recall_loads_prompt_without_sending() {
        let mut app = app();
        let history = app.controller.history().clone();
        history.append(NewMessage::user("first question")).unwrap();
        history.append(NewMessage::assistant("answer")).unwrap();

        assert!(app.handle_line("/recall 1"));

        assert_eq!(app.controller.input(), "first question");
        assert_eq!(history.len(), 2);
        assert!(app.cycle.is_none());
    }

    #[test]
    fn test_quit_stops_the_loop() {
        let mut app = app();
        assert!(!app.handle_line("/quit"));
        assert!(app.handle_line("/help"));
    }

    #[test]
    fn test_plain_text_is_submitted_verbatim() {
        assert_eq!(parse_command("  hello /there "), Command::Submit("  hello /there "));
        assert_eq!(parse_command(""), Command::Submit(""));
    }

    #[test]
    fn test_commands() {
        assert_eq!(parse_command("/stop"), Command::Stop);
        assert_eq!(parse_command("/new"), Command::Clear);
        assert_eq!(parse_command(" /recall 2 "), Command::Recall(2));
        assert_eq!(parse_command("/export chat.md"), Command::Export("chat.md"));
        assert_eq!(parse_command("/model  phi3 "), Command::Model("phi3"));
        assert_eq!(parse_command("/exit"), Command::Quit);
    }

    #[test]
    fn test_malformed_commands() {
        assert_eq!(parse_command("/recall 0"), Command::Unknown("/recall 0"));
        assert_eq!(parse_command("/recall x"), Command::Unknown("/recall x"));
        assert_eq!(parse_command("/export"), Command::Unknown("/export"));
        assert_eq!(parse_command("/dance"), Command::Unknown("/dance"));
    }
}
