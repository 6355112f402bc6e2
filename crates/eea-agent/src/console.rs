//! Interactive console on stdin
//!
//! - `info` prints the agent snapshot as JSON
//! - `direct <trigger-id> <json>` fires a direct trigger
//! - `exit` stops the agent

use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use eea_runtime::AgentHandle;

#[derive(Debug, PartialEq, Eq)]
enum Command<'a> {
    Info,
    Direct { trigger_id: &'a str, payload: &'a str },
    Exit,
}

fn parse(line: &str) -> Result<Option<Command<'_>>, String> {
    let line = line.trim();
    let (word, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));

    match word {
        "" => Ok(None),
        "info" => Ok(Some(Command::Info)),
        "exit" | "quit" => Ok(Some(Command::Exit)),
        "direct" => {
            let (trigger_id, payload) = rest
                .trim()
                .split_once(char::is_whitespace)
                .ok_or_else(|| "usage: direct <trigger-id> <json>".to_string())?;
            let payload = payload.trim();
            serde_json::from_str::<serde_json::Value>(payload)
                .map_err(|e| format!("payload is not valid JSON: {}", e))?;
            Ok(Some(Command::Direct { trigger_id, payload }))
        }
        other => Err(format!("unknown command: {}", other)),
    }
}

/// Read commands until `exit` or end of input
pub async fn run(agent: AgentHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                // Detached stdin; keep running until a signal arrives
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                warn!(error = %e, "Console read failed");
                std::future::pending::<()>().await;
                return;
            }
        };

        match parse(&line) {
            Ok(None) => {}
            Ok(Some(Command::Exit)) => {
                info!("Exit requested from console");
                return;
            }
            Ok(Some(Command::Info)) => match agent.info().await {
                Ok(snapshot) => match serde_json::to_string_pretty(&snapshot) {
                    Ok(json) => println!("{}", json),
                    Err(e) => eprintln!("{}", e),
                },
                Err(e) => eprintln!("{}", e),
            },
            Ok(Some(Command::Direct {
                trigger_id,
                payload,
            })) => match agent.direct_trigger(trigger_id, payload).await {
                Ok(()) => println!("triggered {}", trigger_id),
                Err(e) => eprintln!("direct trigger failed: {}", e),
            },
            Err(message) => eprintln!("{}", message),
        }
    }
}
