//! Interface de linha de comando do batchscribe baseada em clap.
//!
//! Define a struct [`Cli`] com subcomandos [`Command`] (transcribe, list,
//! download, delete, demo) e flags globais (--max-attempts, --verbose, --dev).

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::state_machine::ModelSize;

/// batchscribe: transcrição de áudio em lote com rastreamento de jobs.
#[derive(Debug, Parser)]
#[command(name = "batchscribe", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Número máximo de tentativas de computação por job.
    #[arg(long, global = true)]
    pub max_attempts: Option<u32>,

    /// Habilita saída detalhada (verbose).
    #[arg(long, short, global = true, default_value_t = false)]
    pub verbose: bool,

    /// Usa a tag de desenvolvimento da imagem do container.
    #[arg(long, global = true, default_value_t = false)]
    pub dev: bool,
}

/// Tamanho de modelo aceito pela CLI, mapeado para [`ModelSize`] internamente.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModelArg {
    Tiny,
    Base,
    Small,
    Medium,
    /// Modelo mais preciso (large-v3).
    Large,
}

impl From<ModelArg> for ModelSize {
    fn from(arg: ModelArg) -> Self {
        match arg {
            ModelArg::Tiny => ModelSize::Tiny,
            ModelArg::Base => ModelSize::Base,
            ModelArg::Small => ModelSize::Small,
            ModelArg::Medium => ModelSize::Medium,
            ModelArg::Large => ModelSize::Large,
        }
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Envia um arquivo de áudio e acompanha a transcrição até o fim.
    Transcribe {
        /// Arquivo de áudio local.
        file: PathBuf,

        /// Código do idioma (ex.: en, pt) ou `auto`.
        #[arg(long, short)]
        language: String,

        #[arg(long, short, value_enum, default_value_t = ModelArg::Large)]
        model: ModelArg,

        /// Identificador do job; gerado quando omitido.
        #[arg(long)]
        job_id: Option<String>,
    },

    /// Lista os jobs presentes no artifact store.
    List,

    /// Baixa a saída de um job concluído.
    Download {
        job_id: String,

        /// Diretório de destino.
        #[arg(default_value = ".")]
        out_dir: PathBuf,
    },

    /// Remove todos os objetos de um ou mais jobs.
    Delete {
        #[arg(required = true)]
        job_ids: Vec<String>,
    },

    /// Executa a demonstração embutida com backend simulado.
    Demo,
}
