//! # Swegon Core
//!
//! Pipeline de recepção da telemetria UDP das unidades de ventilação
//! Swegon: separa os frames de cada datagrama, valida o CRC, decodifica os
//! payloads em medições nomeadas e filtra repetições antes de publicar.
//!
//! ## Módulos
//! - [`frame`] – Marcador, CRC-16/CCITT-FALSE e header das mensagens
//! - [`decode`] – Layouts 0x21, 0x71 e 0x73
//! - [`cache`] – Cache TTL/LRU e relógio injetável
//! - [`pipeline`] – Throttle por mensagem e cache de valores publicados
//! - [`diff`] – Diff de mensagens para o modo analisador
//! - [`receiver`] – Thread UDP e ciclo de vida
//! - [`config`] – Configuração unificada via TOML

pub mod cache;
pub mod config;
pub mod decode;
pub mod diff;
pub mod frame;
pub mod pipeline;
pub mod receiver;

// Re-exports convenientes
pub use config::AppConfig;
pub use decode::{Measurement, Value};
pub use pipeline::{MeasurementSink, Pipeline, Publication};
pub use receiver::{ReceiverService, TriggerSource};
