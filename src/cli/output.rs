//! CLI Output Formatting.
//!
//! Text rendering of ledger results with `console` styling, or JSON.

use console::{style, StyledObject};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;

use crate::core::position::Position;
use crate::liquidation::engine::LiquidationEvent;
use crate::liquidation::redistribution::EntireDebtAndCollateral;
use crate::liquidation::stability_pool::{DepositorGains, DepositorPayout, PoolStats, PoolTransition};
use crate::storage::state::LedgerMeta;

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPUT FORMAT
// ═══════════════════════════════════════════════════════════════════════════════

/// Output format options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OutputFormat {
    /// Human-readable text
    #[default]
    Text,
    /// JSON format
    Json,
    /// Pretty JSON format
    JsonPretty,
}

impl OutputFormat {
    /// Whether output is machine-readable
    pub fn is_json(&self) -> bool {
        matches!(self, OutputFormat::Json | OutputFormat::JsonPretty)
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "json-pretty" | "jsonpretty" => Ok(OutputFormat::JsonPretty),
            _ => Err(format!("Unknown format: {}", s)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// OUTPUT FORMATTER
// ═══════════════════════════════════════════════════════════════════════════════

/// Output formatter for CLI
#[derive(Debug, Clone)]
pub struct OutputFormatter {
    /// Output format
    format: OutputFormat,
    /// Color enabled
    color: bool,
}

impl Default for OutputFormatter {
    fn default() -> Self {
        Self::new(OutputFormat::Text)
    }
}

impl OutputFormatter {
    /// Create new formatter
    pub fn new(format: OutputFormat) -> Self {
        Self {
            format,
            color: true,
        }
    }

    /// Disable color
    pub fn without_color(mut self) -> Self {
        self.color = false;
        self
    }

    /// Get format
    pub fn format(&self) -> OutputFormat {
        self.format
    }

    /// Print success message
    pub fn success(&self, message: &str) {
        self.status("success", "✓", message, |s| s.green());
    }

    /// Print error message
    pub fn error(&self, message: &str) {
        if self.format.is_json() {
            self.print_json(&serde_json::json!({ "status": "error", "message": message }));
        } else {
            eprintln!("{} {}", self.paint("✗", |s| s.red()), message);
        }
    }

    /// Print warning message
    pub fn warning(&self, message: &str) {
        self.status("warning", "⚠", message, |s| s.yellow());
    }

    /// Print data as JSON, or as indented key/value text
    pub fn data<T: Serialize>(&self, data: &T) {
        if self.format.is_json() {
            self.print_json(data);
        } else if let Ok(json) = serde_json::to_value(data) {
            for line in self.text_lines(&json, 0) {
                println!("{}", line);
            }
        }
    }

    /// Print a titled block of pre-rendered lines, or the data as JSON
    pub fn report<T: Serialize>(&self, title: &str, lines: &[String], data: &T) {
        if self.format.is_json() {
            self.print_json(data);
            return;
        }
        println!();
        println!("{}", self.paint(title, |s| s.bold().underlined()));
        for line in lines {
            println!("  {}", line);
        }
    }

    /// Render a settled depositor operation
    pub fn payout_lines(&self, payout: &DepositorPayout) -> Vec<String> {
        vec![
            self.field("Deposit before", payout.compounded_before.to_string(), |s| s.dim()),
            self.field("Deposit now", payout.new_deposit.to_string(), |s| s.green()),
            self.field("Withdrawn", payout.withdrawn.to_string(), |s| s.cyan()),
            self.field("Collateral paid", payout.collateral_gain.to_string(), |s| s.yellow()),
            self.field("Reward paid", payout.reward_gain.to_string(), |s| s.magenta()),
        ]
    }

    /// Render what a deposit is worth right now
    pub fn gains_lines(&self, gains: &DepositorGains) -> Vec<String> {
        vec![
            self.field("Compounded", gains.compounded.to_string(), |s| s.green()),
            self.field("Collateral gain", gains.collateral_gain.to_string(), |s| s.yellow()),
            self.field("Reward gain", gains.reward_gain.to_string(), |s| s.magenta()),
        ]
    }

    /// Render a position with its pending rewards folded in
    pub fn position_lines(
        &self,
        position: &Position,
        entire: &EntireDebtAndCollateral,
        ratio: Option<u64>,
    ) -> Vec<String> {
        let status = format!("{:?}", position.status);
        let mut lines = vec![
            self.field("ID", position.id.to_hex(), |s| s),
            self.field("Owner", position.owner.to_hex(), |s| s.dim()),
            self.field("Status", status, |s| s.bold()),
            self.field("Collateral", entire.collateral.to_string(), |s| s.yellow()),
            self.field("Debt", entire.debt.to_string(), |s| s.green()),
            self.field("Stake", position.stake.to_string(), |s| s.dim()),
        ];
        if !entire.pending.is_zero() {
            lines.push(self.field(
                "Pending",
                format!("{} / {}", entire.pending.collateral, entire.pending.debt),
                |s| s.dim(),
            ));
        }
        if let Some(ratio) = ratio {
            lines.push(self.field("Ratio", format!("{}%", ratio), |s| s.cyan()));
        }
        lines
    }

    /// Render pool statistics
    pub fn pool_lines(&self, stats: &PoolStats) -> Vec<String> {
        vec![
            self.field("Total deposits", stats.total_deposits.to_string(), |s| s.green()),
            self.field("Collateral held", stats.collateral_balance.to_string(), |s| s.yellow()),
            self.field("Reward held", stats.reward_balance.to_string(), |s| s.magenta()),
            self.field("Depositors", stats.depositor_count.to_string(), |s| s),
            self.field("Offsets", stats.total_liquidations.to_string(), |s| s),
            self.field("Debt absorbed", stats.total_debt_absorbed.to_string(), |s| s.dim()),
            self.field("P", stats.p.to_string(), |s| s.cyan()),
            self.field(
                "Epoch / scale",
                format!("{} / {}", stats.current_epoch, stats.current_scale),
                |s| s.cyan(),
            ),
        ]
    }

    /// Render one liquidation
    pub fn liquidation_lines(&self, event: &LiquidationEvent) -> Vec<String> {
        let mut lines = vec![
            self.field("Position", event.position_id.to_hex(), |s| s),
            self.field("Ratio", format!("{}%", event.ratio_at_liquidation), |s| s.red()),
            self.field(
                "Offset",
                format!("{} for {}", event.debt_offset, event.collateral_to_pool),
                |s| s.green(),
            ),
        ];
        if !event.fully_offset() {
            lines.push(self.field(
                "Redistributed",
                format!("{} with {}", event.debt_redistributed, event.collateral_redistributed),
                |s| s.yellow(),
            ));
        }
        match event.pool_transition {
            PoolTransition::Unchanged => {}
            PoolTransition::EpochAdvanced(epoch) => {
                lines.push(self.field("Pool", format!("emptied, epoch {}", epoch), |s| s.red()))
            }
            PoolTransition::ScaleAdvanced(scale) => {
                lines.push(self.field("Pool", format!("scale {}", scale), |s| s.cyan()))
            }
        }
        lines
    }

    /// Render persisted ledger metadata
    pub fn meta_lines(&self, meta: &LedgerMeta) -> Vec<String> {
        let price = meta.price.map_or_else(|| "unset".to_string(), |p| p.to_string());
        vec![
            self.field("Block", meta.block_height.to_string(), |s| s),
            self.field("Price", price, |s| s.cyan()),
            self.field("Pool hash", meta.pool_hash.to_hex(), |s| s.dim()),
            self.field("Ledger hash", meta.ledger_hash.to_hex(), |s| s.dim()),
            self.field("Events", meta.events_recorded.to_string(), |s| s),
        ]
    }

    fn status(
        &self,
        kind: &str,
        mark: &str,
        message: &str,
        paint: impl FnOnce(StyledObject<String>) -> StyledObject<String>,
    ) {
        if self.format.is_json() {
            self.print_json(&serde_json::json!({ "status": kind, "message": message }));
        } else {
            println!("{} {}", self.paint(mark, paint), message);
        }
    }

    fn field(
        &self,
        label: &str,
        value: String,
        paint: impl FnOnce(StyledObject<String>) -> StyledObject<String>,
    ) -> String {
        format!("{:<16} {}", format!("{}:", label), self.paint(&value, paint))
    }

    fn paint(
        &self,
        text: &str,
        paint: impl FnOnce(StyledObject<String>) -> StyledObject<String>,
    ) -> String {
        paint(style(text.to_string()))
            .force_styling(self.color)
            .to_string()
    }

    fn print_json<T: Serialize>(&self, data: &T) {
        let output = if matches!(self.format, OutputFormat::JsonPretty) {
            serde_json::to_string_pretty(data)
        } else {
            serde_json::to_string(data)
        };

        if let Ok(json) = output {
            println!("{}", json);
        }
    }

    fn text_lines(&self, json: &serde_json::Value, indent: usize) -> Vec<String> {
        let prefix = "  ".repeat(indent);
        let mut lines = Vec::new();

        match json {
            serde_json::Value::Object(map) => {
                for (key, value) in map {
                    let key = self.paint(key, |s| s.bold());
                    match value {
                        serde_json::Value::Object(_) | serde_json::Value::Array(_) => {
                            lines.push(format!("{}{}:", prefix, key));
                            lines.extend(self.text_lines(value, indent + 1));
                        }
                        _ => lines.push(format!("{}{}: {}", prefix, key, format_value(value))),
                    }
                }
            }
            serde_json::Value::Array(arr) => {
                for (i, item) in arr.iter().enumerate() {
                    lines.push(format!("{}[{}]:", prefix, i));
                    lines.extend(self.text_lines(item, indent + 1));
                }
            }
            _ => lines.push(format!("{}{}", prefix, format_value(json))),
        }

        lines
    }
}

/// Format a JSON value for text output
fn format_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => "null".into(),
        serde_json::Value::Bool(b) => b.to_string(),
        serde_json::Value::Number(n) => n.to_string(),
        serde_json::Value::String(s) => s.clone(),
        _ => value.to_string(),
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PROGRESS
// ═══════════════════════════════════════════════════════════════════════════════

/// Spinner for a single slow step
pub fn create_spinner(message: &str) -> ProgressBar {
    let spinner = ProgressBar::new_spinner();
    let spinner_style = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner());
    spinner.set_style(spinner_style);
    spinner.set_message(message.to_string());
    spinner.enable_steady_tick(std::time::Duration::from_millis(100));
    spinner
}

/// Progress bar over a known number of steps
pub fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let bar = ProgressBar::new(len);
    let bar_style = ProgressStyle::default_bar()
        .template("{msg} [{bar:30.cyan/blue}] {pos}/{len}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█░ ");
    bar.set_style(bar_style);
    bar.set_message(message.to_string());
    bar
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
