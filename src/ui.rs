//! Interface de terminal do batchscribe: spinners e saída colorida.
//!
//! Usa as crates `indicatif` para spinners de progresso e `console` para
//! estilização com cores. O [`JobProgress`] acompanha visualmente
//! a execução de um job no terminal.

use console::Style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::state_machine::{JobRecord, JobState};

/// Indicador visual de progresso para um job acompanhado no terminal.
///
/// Exibe um spinner animado enquanto o job está vivo e mensagens
/// coloridas para sucesso (verde), falha (vermelho) e retentativa (amarelo).
pub struct JobProgress {
    // Barra de progresso/spinner do indicatif.
    pb: ProgressBar,
    green: Style,
    red: Style,
    yellow: Style,
    last_attempt: u32,
}

impl JobProgress {
    /// Inicia o spinner para o job e retorna a instância de progresso.
    pub fn start(job_id: &str) -> Self {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {prefix:.bold} {msg}") {
            pb.set_style(style);
        }
        pb.set_prefix(job_id.to_string());
        pb.set_message(JobState::Pending.to_string());
        pb.enable_steady_tick(std::time::Duration::from_millis(100));

        Self {
            pb,
            green: Style::new().green().bold(),
            red: Style::new().red().bold(),
            yellow: Style::new().yellow(),
            last_attempt: 0,
        }
    }

    /// Atualiza o spinner com o estado atual e anuncia novas tentativas.
    pub fn update(&mut self, record: &JobRecord) {
        if record.attempt_count > 1 && record.attempt_count != self.last_attempt {
            let reason = record
                .last_error
                .as_ref()
                .map(ToString::to_string)
                .unwrap_or_default();
            self.pb.println(format!(
                "  {} Retry {}/{}: {reason}",
                self.yellow.apply_to("↻"),
                record.attempt_count,
                record.max_attempts
            ));
        }
        self.last_attempt = record.attempt_count;
        self.pb.set_message(format!(
            "{} (attempt {}/{})",
            record.state, record.attempt_count, record.max_attempts
        ));
    }

    /// Finaliza o spinner e exibe o resultado final do job.
    ///
    /// Sucesso é mostrado em verde com checkmark; qualquer outro estado
    /// terminal em vermelho com X.
    pub fn complete(&self, record: &JobRecord) {
        self.pb.finish_and_clear();
        match (record.state, &record.last_error) {
            (JobState::Succeeded, _) => {
                println!("  {} Job {} succeeded", self.green.apply_to("✓"), record.job_id());
            }
            (state, Some(error)) => {
                println!("  {} Job {} {state}: {error}", self.red.apply_to("✗"), record.job_id());
            }
            (state, None) => {
                println!("  {} Job {} {state}", self.red.apply_to("✗"), record.job_id());
            }
        }
    }

    /// Imprime o snapshot do job em JSON com estilo colorido.
    pub fn print_record(&self, record: &JobRecord) {
        let style = match record.state {
            JobState::Succeeded => &self.green,
            JobState::Failed | JobState::TimedOut | JobState::Cancelled => &self.red,
            _ => &self.yellow,
        };
        println!();
        println!("{}", style.apply_to("─── Job Record ───"));
        println!("{}", serde_json::to_string_pretty(record).unwrap_or_default());
    }
}
