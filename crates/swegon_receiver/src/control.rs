//! Comandos de controle lidos do stdin.

use crossbeam_channel::{Receiver, never, unbounded};
use std::io::BufRead;
use tracing::warn;

/// Comando do operador.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Trigger manual: republica tudo.
    Refresh,
    /// Mensagem para o tópico `analyzerMode`.
    Analyzer(String),
    /// Health check e contadores.
    Status,
    Quit,
}

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let mut parts = line.split_whitespace();
        let command = parts.next().unwrap_or_default().to_lowercase();
        match command.as_str() {
            "refresh" | "update" => Ok(Command::Refresh),
            "analyzer" | "analyzermode" => match parts.next() {
                Some(value) => Ok(Command::Analyzer(value.to_string())),
                None => Err("uso: analyzer <yes|no>".into()),
            },
            "status" => Ok(Command::Status),
            "quit" | "exit" => Ok(Command::Quit),
            "" => Err("comando vazio".into()),
            other => Err(format!("comando desconhecido: {other}")),
        }
    }
}

/// Inicia a thread que lê o stdin. EOF vira [`Command::Quit`].
///
/// Sem thread, retorna um channel que nunca entrega nada.
pub fn spawn_stdin_reader() -> Receiver<Command> {
    let (tx, rx) = unbounded();

    let spawned = std::thread::Builder::new()
        .name("stdin-control".into())
        .spawn(move || {
            let stdin = std::io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if line.trim().is_empty() {
                    continue;
                }
                match Command::parse(&line) {
                    Ok(command) => {
                        if tx.send(command).is_err() {
                            return;
                        }
                    }
                    Err(e) => warn!("{e}"),
                }
            }
            let _ = tx.send(Command::Quit);
        });

    match spawned {
        Ok(_) => rx,
        Err(e) => {
            warn!("Sem controle via stdin: {e}");
            never()
        }
    }
}
