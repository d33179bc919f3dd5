//! Configuração do batchscribe carregada a partir de `batchscribe.toml`.
//!
//! A struct [`BatchscribeConfig`] contém todos os parâmetros configuráveis,
//! agrupados nas tabelas `[tracker]`, `[store]` e `[backend]`.
//! Valores não presentes no arquivo usam defaults sensíveis.
//! As variáveis de ambiente `BATCHSCRIBE_STORE_ROOT` e
//! `BATCHSCRIBE_BACKEND_COMMAND` têm precedência sobre o arquivo.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use rand::Rng;
use serde::Deserialize;

use crate::state_machine::RetryConfig;

const CONFIG_FILE: &str = "batchscribe.toml";

/// Configuração de nível superior carregada de `batchscribe.toml`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BatchscribeConfig {
    #[serde(default)]
    pub tracker: TrackerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub backend: BackendConfig,
}

/// Política de retentativas, polling e retenção do rastreador de jobs.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Máximo de tentativas de computação por job (e de retentativas por etapa).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Intervalo base entre consultas de status ao backend.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Fração de jitter aplicada ao intervalo de polling (0.2 = ±20%).
    #[serde(default = "default_poll_jitter")]
    pub poll_jitter: f64,

    /// Prazo total de um job antes de ser marcado como `TimedOut`.
    #[serde(default = "default_job_timeout_secs")]
    pub job_timeout_secs: u64,

    /// Por quanto tempo um job terminal continua consultável.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Atraso base em milissegundos para backoff exponencial.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Teto de um único atraso de backoff.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Limite de tempo de cada chamada individual ao backend ou ao storage.
    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,

    /// Intervalo da varredura que remove jobs terminais expirados.
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

/// Localização do artifact store local.
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

/// Backend de processos locais.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BackendConfig {
    /// Programa e argumentos executados para cada tentativa.
    #[serde(default)]
    pub command: Vec<String>,

    /// Tag da imagem do container; `dev` troca para a tag de desenvolvimento.
    #[serde(default = "default_image_tag")]
    pub image_tag: String,

    #[serde(default)]
    pub dev: bool,
}

// Valor padrão para tentativas máximas: 3.
fn default_max_attempts() -> u32 {
    3
}

// Valor padrão para o intervalo de polling: 15s.
fn default_poll_interval_ms() -> u64 {
    15_000
}

fn default_poll_jitter() -> f64 {
    0.2
}

// Valor padrão para o prazo do job: 6h.
fn default_job_timeout_secs() -> u64 {
    6 * 60 * 60
}

// Valor padrão para a retenção: 24h após o estado terminal.
fn default_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_call_timeout_ms() -> u64 {
    30_000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_store_root() -> PathBuf {
    PathBuf::from("batchscribe-store")
}

fn default_image_tag() -> String {
    "1".to_string()
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_jitter: default_poll_jitter(),
            job_timeout_secs: default_job_timeout_secs(),
            retention_secs: default_retention_secs(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            call_timeout_ms: default_call_timeout_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

impl TrackerConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Intervalo de polling com jitter uniforme de ±`poll_jitter`, para que
    /// muitos jobs não consultem o backend ao mesmo tempo.
    pub fn jittered_poll_interval(&self) -> Duration {
        let jitter = self.poll_jitter.clamp(0.0, 0.95);
        if jitter == 0.0 {
            return self.poll_interval();
        }
        let factor = rand::rng().random_range((1.0 - jitter)..=(1.0 + jitter));
        self.poll_interval().mul_f64(factor)
    }

    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

impl BackendConfig {
    /// Tag efetiva da imagem, considerando o modo de desenvolvimento.
    pub fn effective_image_tag(&self) -> &str {
        if self.dev { "dev" } else { &self.image_tag }
    }
}

impl BatchscribeConfig {
    /// Carrega a configuração de `batchscribe.toml` no diretório atual.
    /// Usa valores padrão se o arquivo não existir.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE))
    }

    /// Carrega a configuração de um caminho explícito.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str::<BatchscribeConfig>(&contents)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };

        // Variáveis de ambiente têm precedência sobre o arquivo de configuração.
        if let Ok(root) = std::env::var("BATCHSCRIBE_STORE_ROOT")
            && !root.is_empty()
        {
            config.store.root = PathBuf::from(root);
        }
        if let Ok(command) = std::env::var("BATCHSCRIBE_BACKEND_COMMAND")
            && !command.trim().is_empty()
        {
            config.backend.command = command.split_whitespace().map(str::to_string).collect();
        }

        Ok(config)
    }
}
