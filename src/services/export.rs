use chrono::{DateTime, Local};

use crate::models::{Message, Role};

fn format_timestamp(timestamp: i64) -> String {
    DateTime::from_timestamp_millis(timestamp)
        .map(|dt| dt.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn export_to_markdown(model: &str, messages: &[Message]) -> String {
    let mut output = String::from("# Chat transcript\n\n");

    let started = messages
        .first()
        .map(|m| format_timestamp(m.timestamp))
        .unwrap_or_else(|| "-".to_string());
    output.push_str(&format!("> Model: {} | Date: {}\n\n", model, started));
    output.push_str("---\n\n");

    for msg in messages {
        let role_label = match msg.role {
            Role::User => "You",
            Role::Assistant => model,
        };
        output.push_str(&format!("### {}\n\n{}\n\n", role_label, msg.content));
    }

    output
}
