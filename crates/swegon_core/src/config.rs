//! Configuração unificada via TOML.
//!
//! Um único `config.toml` ao lado do executável; variáveis de ambiente da
//! instalação antiga (`UDP_PORT`, `CACHE_TIME`, `MSG_THROTTLE_TIME`,
//! `ANALYZER_MODE`) têm prioridade sobre o arquivo.

use crate::pipeline::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Maior TTL aceito para os caches (segundos).
pub const MAX_CACHE_TTL_SECS: u64 = 7 * 24 * 3600;

/// Erros de leitura/escrita da configuração.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Erro ao ler {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Erro ao parsear {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Erro ao serializar configuração: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Erro ao gravar {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Interpreta flags textuais: "yes", "true" ou "1" (sem diferenciar maiúsculas).
pub fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "yes" | "true" | "1")
}

/// Socket UDP e thread do receptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Porta UDP para escutar
    pub port: u16,
    /// IP local para bind
    pub bind_ip: String,
    /// Tamanho do buffer de recepção (bytes)
    pub buffer_size: usize,
    /// Timeout de leitura; limita a latência do stop
    pub read_timeout_ms: u64,
    /// Espera máxima pela thread no stop
    pub join_timeout_secs: u64,
    /// Loga diffs e frames rejeitados em nível de erro
    pub analyzer_mode: bool,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            port: 9999,
            bind_ip: "0.0.0.0".into(),
            buffer_size: 1024,
            read_timeout_ms: 1000,
            join_timeout_secs: 5,
            analyzer_mode: false,
        }
    }
}

impl ReceiverConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_ip, self.port)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }
}

/// TTLs e capacidade dos caches.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// TTL do cache de valores publicados (segundos)
    pub cache_time_secs: u64,
    /// TTL do throttle por mensagem (segundos)
    pub msg_throttle_secs: u64,
    /// Entradas máximas por cache
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_time_secs: 300,
            msg_throttle_secs: 5,
            capacity: 256,
        }
    }
}

/// Parâmetros do processo hospedeiro.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Intervalo entre triggers agendados e health checks (segundos)
    pub update_interval_secs: u64,
    /// Capacidade do channel de publicações
    pub channel_capacity: usize,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: 60,
            channel_capacity: 256,
        }
    }
}

/// Configuração raiz do aplicativo.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub receiver: ReceiverConfig,
    pub cache: CacheConfig,
    pub host: HostConfig,
}

impl AppConfig {
    /// Carrega configuração de um arquivo TOML, com fallback para o padrão.
    pub fn load(path: &Path) -> Self {
        if path.exists() {
            match Self::read(path) {
                Ok(config) => {
                    info!("Configuração carregada de {}", path.display());
                    return config;
                }
                Err(e) => warn!("{e}"),
            }
        }

        info!("Usando configuração padrão");
        AppConfig::default()
    }

    /// Lê e parseia um arquivo TOML sem fallback.
    pub fn read(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Salva configuração em arquivo TOML.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })?;
        info!("Configuração salva em {}", path.display());
        Ok(())
    }

    /// Retorna o caminho padrão do config.toml.
    pub fn default_path() -> PathBuf {
        let exe_dir = std::env::current_exe()
            .map(|p| p.parent().unwrap_or(Path::new(".")).to_path_buf())
            .unwrap_or_else(|_| PathBuf::from("."));
        exe_dir.join("config.toml")
    }

    /// Aplica overrides das variáveis de ambiente do processo.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Aplica overrides vindos de `lookup` (nome da variável → valor).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(raw) = lookup("UDP_PORT") {
            match raw.trim().parse() {
                Ok(port) => self.receiver.port = port,
                Err(e) => warn!("UDP_PORT inválido ({raw}): {e}"),
            }
        }
        if let Some(raw) = lookup("CACHE_TIME") {
            match raw.trim().parse() {
                Ok(secs) => self.cache.cache_time_secs = secs,
                Err(e) => warn!("CACHE_TIME inválido ({raw}): {e}"),
            }
        }
        if let Some(raw) = lookup("MSG_THROTTLE_TIME") {
            match raw.trim().parse() {
                Ok(secs) => self.cache.msg_throttle_secs = secs,
                Err(e) => warn!("MSG_THROTTLE_TIME inválido ({raw}): {e}"),
            }
        }
        if let Some(raw) = lookup("ANALYZER_MODE") {
            self.receiver.analyzer_mode = parse_flag(&raw);
        }
    }

    /// Parâmetros do pipeline derivados da configuração.
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            msg_throttle: Duration::from_secs(self.cache.msg_throttle_secs),
            value_ttl: Duration::from_secs(self.cache.cache_time_secs),
            capacity: self.cache.capacity,
            analyzer_mode: self.receiver.analyzer_mode,
        }
    }

    /// Valida a configuração e retorna lista de erros.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.receiver.port == 0 {
            errors.push("Porta do receiver não pode ser 0".into());
        }
        if self.receiver.buffer_size <= crate::frame::MIN_FRAME_LEN
            || self.receiver.buffer_size > 65536
        {
            errors.push(format!(
                "Buffer do receiver inválido: {} (11–65536)",
                self.receiver.buffer_size
            ));
        }
        if self.receiver.read_timeout_ms == 0 {
            errors.push("Timeout de leitura não pode ser 0".into());
        }
        for (name, secs) in [
            ("cache_time_secs", self.cache.cache_time_secs),
            ("msg_throttle_secs", self.cache.msg_throttle_secs),
        ] {
            if secs == 0 || secs > MAX_CACHE_TTL_SECS {
                errors.push(format!("{name} inválido: {secs} (1–{MAX_CACHE_TTL_SECS})"));
            }
        }
        if self.cache.capacity == 0 {
            errors.push("Capacidade do cache não pode ser 0".into());
        }
        if self.host.update_interval_secs == 0 {
            errors.push("Intervalo de update não pode ser 0".into());
        }

        errors
    }
}
