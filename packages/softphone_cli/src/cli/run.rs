use std::io::BufRead;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use softphone_control::{CommandIntent, Engine, EngineConfig, LoggingHandler};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::READY_TIMEOUT;

/// One line typed at the prompt
#[derive(Debug, PartialEq, Eq)]
pub enum ReplCommand {
    Send(CommandIntent),
    Status,
    Quit,
}

fn switch_arg(verb: &str, arg: Option<&str>, on: &str, off: &str) -> Result<bool, String> {
    match arg {
        Some(a) if a == on => Ok(true),
        Some(a) if a == off => Ok(false),
        _ => Err(format!("usage: {verb} {on}|{off}")),
    }
}

/// Parse a prompt line; `Ok(None)` for blank input
pub fn parse_line(line: &str) -> Result<Option<ReplCommand>, String> {
    let mut words = line.split_whitespace();
    let Some(verb) = words.next() else {
        return Ok(None);
    };
    let arg = words.next();

    let intent = match verb {
        "call" | "dial" => match arg {
            Some(number) => CommandIntent::call(number),
            None => return Err("usage: call <number>".to_string()),
        },
        "answer" => CommandIntent::answer(),
        "bye" | "hangup" => CommandIntent::bye(),
        "mute" => CommandIntent::mute(),
        "unmute" => CommandIntent::un_mute(),
        "dtmf" => match arg {
            Some(digits) => CommandIntent::dtmf(digits),
            None => return Err("usage: dtmf <digits>".to_string()),
        },
        "hold" => CommandIntent::hold(),
        "unhold" | "retrieve" => CommandIntent::un_hold(),
        "register" => CommandIntent::register(),
        "deregister" => CommandIntent::deregister(),
        "line" => match arg.and_then(|a| a.parse::<u8>().ok()) {
            Some(n) => CommandIntent::set_line(n),
            None => return Err("usage: line <1|2>".to_string()),
        },
        "dnd" => CommandIntent::dnd(switch_arg(verb, arg, "on", "off")?),
        "user" => CommandIntent::user(arg),
        "presence" => CommandIntent::presence(switch_arg(verb, arg, "online", "offline")?),
        "auto-answer" | "auto_answer" => {
            CommandIntent::auto_answer(switch_arg(verb, arg, "on", "off")?)
        }
        "help" => CommandIntent::help(),
        "status" => return Ok(Some(ReplCommand::Status)),
        "quit" | "exit" => return Ok(Some(ReplCommand::Quit)),
        other => return Err(format!("unknown command: {other}")),
    };
    Ok(Some(ReplCommand::Send(intent)))
}

async fn wait_stopped(engine: &Engine) {
    while engine.is_running() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}

/// Spawn the softphone and feed it commands read from stdin until EOF,
/// `quit`, Ctrl-C or the softphone exiting on its own.
pub async fn run_command(config: EngineConfig) -> Result<()> {
    let engine = Engine::spawn(config, vec![Arc::new(LoggingHandler)])
        .context("Failed to start softphone")?;

    if !engine.wait_ready(READY_TIMEOUT).await {
        warn!("No start-up banner after {:?}, sending commands anyway", READY_TIMEOUT);
    }

    let (tx, mut rx) = mpsc::channel::<String>(64);
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            if tx.blocking_send(line).is_err() {
                break;
            }
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else {
                    info!("stdin closed");
                    break;
                };
                match parse_line(&line) {
                    Ok(None) => {}
                    Ok(Some(ReplCommand::Quit)) => break,
                    Ok(Some(ReplCommand::Status)) => {
                        println!("{}", serde_json::to_string_pretty(&engine.current_state())?);
                    }
                    Ok(Some(ReplCommand::Send(intent))) => {
                        if let Err(e) = engine.send(intent) {
                            warn!("{}", e);
                            break;
                        }
                    }
                    Err(usage) => eprintln!("{usage}"),
                }
            }
            _ = &mut ctrl_c => {
                info!("Interrupted");
                break;
            }
            _ = wait_stopped(&engine) => {
                info!("Softphone stopped");
                break;
            }
        }
    }

    engine.quit().await;
    Ok(())
}
