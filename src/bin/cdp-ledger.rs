//! cdp-ledger CLI
//!
//! Drives a persisted Stability Pool and redistribution ledger from the
//! command line.

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use console::{style, Term};

use cdp_ledger::cli::{
    create_progress_bar, create_spinner, AnyStore, CliApp, CliConfig, OutputFormat, Scenario,
    ScenarioRunner, StorageFormat,
};
use cdp_ledger::core::amount::{CollateralAmount, RewardAmount, TokenAmount};
use cdp_ledger::core::config::ProtocolParams;
use cdp_ledger::liquidation::redistribution::EntireDebtAndCollateral;
use cdp_ledger::protocol::{OperationOutcome, Protocol};
use cdp_ledger::storage::backend::StorageBackend;
use cdp_ledger::storage::state::LedgerMeta;
use cdp_ledger::utils::hash::{AccountId, PositionId};

/// cdp-ledger - Stability Pool and redistribution ledger for a CDP system
#[derive(Parser)]
#[command(name = "cdp-ledger")]
#[command(author = "cdp-ledger Team")]
#[command(version = cdp_ledger::VERSION)]
#[command(about = "Loss and gain distribution ledger for a collateralized debt protocol", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Path to data directory
    #[arg(short, long, env = "CDP_LEDGER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Storage format (json, binary)
    #[arg(long)]
    format: Option<String>,

    /// Tracing directive, e.g. `debug` or `cdp_ledger=trace`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Output format (text, json, json-pretty)
    #[arg(short, long, default_value = "text")]
    output: String,

    /// Set the collateral price before running the command
    #[arg(short, long)]
    price: Option<String>,

    /// Advance to this block height before running the command
    #[arg(short, long)]
    block: Option<u64>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new ledger in the data directory
    Init {
        /// Wipe an existing ledger
        #[arg(short, long)]
        force: bool,

        /// Minimum collateral ratio, percent
        #[arg(long)]
        min_ratio: Option<u64>,

        /// Minimum position debt, stable tokens
        #[arg(long)]
        min_debt: Option<String>,

        /// Minimum pool deposit, stable tokens
        #[arg(long)]
        min_deposit: Option<String>,
    },

    /// Deposit stable tokens into the Stability Pool
    Deposit {
        /// Depositor name
        account: String,
        /// Amount, stable tokens
        amount: String,
    },

    /// Withdraw from the Stability Pool
    Withdraw {
        /// Depositor name
        account: String,
        /// Amount, stable tokens; everything when omitted
        amount: Option<String>,
    },

    /// Claim collateral and reward gains
    Claim {
        /// Depositor name
        account: String,
    },

    /// Spread reward tokens over current depositors
    Reward {
        /// Amount, reward tokens
        amount: String,
    },

    /// Open a position
    Open {
        /// Owner name
        account: String,
        /// Collateral, collateral tokens
        collateral: String,
        /// Debt, stable tokens
        debt: String,
    },

    /// Adjust a position
    Adjust {
        /// Position id (hex)
        position: String,

        /// Collateral to add
        #[arg(long)]
        add_collateral: Option<String>,

        /// Debt to repay
        #[arg(long)]
        repay: Option<String>,

        /// Debt to draw
        #[arg(long)]
        borrow: Option<String>,

        /// Collateral to withdraw
        #[arg(long)]
        withdraw_collateral: Option<String>,
    },

    /// Close a position
    Close {
        /// Position id (hex)
        position: String,
    },

    /// Liquidate one position, or every undercollateralized one
    Liquidate {
        /// Position id (hex); all liquidatable positions when omitted
        position: Option<String>,
    },

    /// Show Stability Pool statistics
    Pool,

    /// Show a depositor's compounded deposit and gains
    Depositor {
        /// Depositor name
        account: String,
    },

    /// Show one position, or list active positions
    Position {
        /// Position id (hex)
        id: Option<String>,

        /// List positions of this owner
        #[arg(long)]
        owner: Option<String>,
    },

    /// Run a JSON scenario file against the ledger
    Replay {
        /// Scenario file
        file: PathBuf,

        /// Run without saving the result
        #[arg(long)]
        dry_run: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let term = Term::stdout();

    let app = match build_app(&cli) {
        Ok(app) => app,
        Err(e) => {
            eprintln!("{} {}", style("Error:").red().bold(), e);
            std::process::exit(1);
        }
    };

    let filter = match &cli.log_level {
        Some(level) => tracing_subscriber::EnvFilter::new(level),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&app.config().log_level)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    if let Err(e) = run_command(&cli, &app, &term) {
        app.output().error(&format!("{:#}", e));
        std::process::exit(1);
    }
}

/// Config file, then `CDP_LEDGER_*` variables, then flags
fn build_app(cli: &Cli) -> anyhow::Result<CliApp> {
    let data_dir = cli
        .data_dir
        .clone()
        .unwrap_or_else(cdp_ledger::cli::default_data_dir);

    let mut config = CliConfig::load_or_default(&CliConfig::path_in(&data_dir))?.with_env();
    config.data_dir = data_dir;
    if let Some(format) = &cli.format {
        config.storage_format = format.parse::<StorageFormat>()?;
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    config.validate()?;

    let format = cli
        .output
        .parse::<OutputFormat>()
        .map_err(|e| anyhow::anyhow!(e))?;
    Ok(CliApp::new(config).with_format(format))
}

fn run_command(cli: &Cli, app: &CliApp, term: &Term) -> anyhow::Result<()> {
    match &cli.command {
        Commands::Init {
            force,
            min_ratio,
            min_debt,
            min_deposit,
        } => cmd_init(cli, app, term, *force, *min_ratio, min_debt, min_deposit),
        Commands::Replay { file, dry_run } => cmd_replay(cli, app, term, file, *dry_run),
        Commands::Pool => {
            let protocol = open(cli, app)?;
            let stats = protocol.pool().statistics();
            app.output()
                .report("Stability Pool", &app.output().pool_lines(&stats), &stats);
            Ok(())
        }
        Commands::Depositor { account } => {
            let protocol = open(cli, app)?;
            let gains = protocol.depositor_gains(&AccountId::from_name(account))?;
            app.output()
                .report(&format!("Depositor {}", account), &app.output().gains_lines(&gains), &gains);
            Ok(())
        }
        Commands::Position { id, owner } => cmd_position(cli, app, id.as_deref(), owner.as_deref()),
        command => {
            let mut protocol = open(cli, app)?;
            mutate(&mut protocol, app, command)?;
            commit(&protocol).map(|_| ())
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// COMMAND HANDLERS
// ═══════════════════════════════════════════════════════════════════════════════

fn cmd_init(
    cli: &Cli,
    app: &CliApp,
    term: &Term,
    force: bool,
    min_ratio: Option<u64>,
    min_debt: &Option<String>,
    min_deposit: &Option<String>,
) -> anyhow::Result<()> {
    let config = app.config();
    let _ = term.write_line(&format!(
        "{} Initializing ledger in {}",
        style("→").cyan(),
        config.data_dir.display()
    ));

    let mut params = ProtocolParams::default();
    if let Some(ratio) = min_ratio {
        params.min_collateral_ratio = ratio;
    }
    if let Some(debt) = min_debt {
        params.min_debt = TokenAmount::parse(debt)?.units();
    }
    if let Some(deposit) = min_deposit {
        params.min_pool_deposit = TokenAmount::parse(deposit)?.units();
    }

    if force {
        let store = AnyStore::open(config)?;
        store.clear()?;
        store.flush()?;
    }

    let mut protocol = app.create_protocol(params)?;
    prepare(cli, &mut protocol)?;
    config.save(&CliConfig::path_in(&config.data_dir))?;
    let meta = commit(&protocol)?;

    let output = app.output();
    output.report("Ledger", &output.meta_lines(&meta), &meta);
    output.success(&format!(
        "Ledger created ({} storage, MCR {}%)",
        config.storage_format,
        protocol.params().min_collateral_ratio
    ));
    Ok(())
}

fn mutate(protocol: &mut Protocol<AnyStore>, app: &CliApp, command: &Commands) -> anyhow::Result<()> {
    let output = app.output();
    match command {
        Commands::Deposit { account, amount } => {
            let payout = protocol.deposit(AccountId::from_name(account), TokenAmount::parse(amount)?)?;
            output.report("Deposit", &output.payout_lines(&payout), &payout);
        }
        Commands::Withdraw { account, amount } => {
            let depositor = AccountId::from_name(account);
            let payout = match amount {
                Some(amount) => protocol.withdraw(&depositor, TokenAmount::parse(amount)?)?,
                None => protocol.withdraw_all(&depositor)?,
            };
            output.report("Withdrawal", &output.payout_lines(&payout), &payout);
        }
        Commands::Claim { account } => {
            let payout = protocol.claim_gains(&AccountId::from_name(account))?;
            output.report("Gains claimed", &output.payout_lines(&payout), &payout);
        }
        Commands::Reward { amount } => {
            let issued = protocol.issue_reward(RewardAmount::parse(amount)?)?;
            if issued.is_zero() {
                output.warning("Pool is empty, no reward issued");
            } else {
                output.success(&format!("Issued {}", issued));
            }
        }
        Commands::Open {
            account,
            collateral,
            debt,
        } => {
            let id = protocol.open_position(
                AccountId::from_name(account),
                CollateralAmount::parse(collateral)?,
                TokenAmount::parse(debt)?,
            )?;
            output.success(&format!("Opened position {}", id));
        }
        Commands::Adjust {
            position,
            add_collateral,
            repay,
            borrow,
            withdraw_collateral,
        } => {
            let id = parse_position(position)?;
            let mut last = None;
            if let Some(amount) = add_collateral {
                last = Some(protocol.add_collateral(&id, CollateralAmount::parse(amount)?)?);
            }
            if let Some(amount) = repay {
                last = Some(protocol.repay(&id, TokenAmount::parse(amount)?)?);
            }
            if let Some(amount) = borrow {
                last = Some(protocol.borrow(&id, TokenAmount::parse(amount)?)?);
            }
            if let Some(amount) = withdraw_collateral {
                last = Some(protocol.withdraw_collateral(&id, CollateralAmount::parse(amount)?)?);
            }
            let Some(update) = last else {
                anyhow::bail!("Nothing to adjust: pass at least one amount flag");
            };
            output.data(&update);
        }
        Commands::Close { position } => {
            let (collateral, debt) = protocol.close_position(&parse_position(position)?)?;
            output.success(&format!("Closed: released {}, repaid {}", collateral, debt));
        }
        Commands::Liquidate { position } => {
            let events = match position {
                Some(position) => vec![protocol.liquidate(&parse_position(position)?)?],
                None => protocol.liquidate_all()?,
            };
            if events.is_empty() {
                output.warning("No position below the minimum collateral ratio");
            }
            for event in &events {
                output.report("Liquidation", &output.liquidation_lines(event), event);
            }
        }
        _ => {}
    }
    Ok(())
}

fn cmd_position(
    cli: &Cli,
    app: &CliApp,
    id: Option<&str>,
    owner: Option<&str>,
) -> anyhow::Result<()> {
    let protocol = open(cli, app)?;
    let output = app.output();

    let ids: Vec<PositionId> = match (id, owner) {
        (Some(id), _) => vec![parse_position(id)?],
        (None, Some(owner)) => protocol
            .positions()
            .get_by_owner(&AccountId::from_name(owner))
            .into_iter()
            .map(|p| p.id)
            .collect(),
        (None, None) => protocol.positions().active_positions().map(|p| p.id).collect(),
    };

    if ids.is_empty() {
        output.warning("No positions found");
    }
    for id in ids {
        let position = protocol.position(&id)?;
        if !position.is_active() {
            let settled = EntireDebtAndCollateral {
                debt: position.debt,
                collateral: position.collateral,
                pending: Default::default(),
            };
            output.report("Position", &output.position_lines(position, &settled, None), position);
            continue;
        }
        let entire = protocol.entire_debt_and_collateral(&id)?;
        let ratio = protocol
            .price()
            .map(|price| protocol.positions().current_ratio(&id, price))
            .transpose()?;
        output.report("Position", &output.position_lines(position, &entire, ratio), position);
    }
    Ok(())
}

fn cmd_replay(
    cli: &Cli,
    app: &CliApp,
    term: &Term,
    file: &Path,
    dry_run: bool,
) -> anyhow::Result<()> {
    let scenario = Scenario::load(file)?;
    let params = scenario.params.clone().unwrap_or_default();

    let mut protocol = if dry_run {
        Protocol::open(AnyStore::open(app.config())?)
            .or_else(|_| app.create_protocol(params.clone()))?
    } else {
        app.open_or_create_protocol(params)?
    };
    prepare(cli, &mut protocol)?;

    let _ = term.write_line(&format!(
        "{} Replaying {} ({} steps)",
        style("→").cyan(),
        style(&scenario.name).bold(),
        scenario.len()
    ));

    let bar = create_progress_bar(scenario.len() as u64, "steps");
    let mut runner = ScenarioRunner::new();
    let result = runner.run(&mut protocol, &scenario, |report| {
        bar.set_message(report.action);
        bar.inc(1);
    });
    bar.finish_and_clear();
    let reports = result?;

    let liquidations: usize = reports
        .iter()
        .filter_map(|r| match &r.outcome {
            Some(OperationOutcome::Liquidated(events)) => Some(events.len()),
            _ => None,
        })
        .sum();

    protocol.check_invariants()?;
    if dry_run {
        app.output().warning("Dry run: ledger not saved");
    } else {
        commit(&protocol)?;
    }
    app.output().success(&format!(
        "{} steps applied, {} liquidations",
        reports.len(),
        liquidations
    ));
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

fn open(cli: &Cli, app: &CliApp) -> anyhow::Result<Protocol<AnyStore>> {
    let mut protocol = app.open_protocol().map_err(|e| {
        anyhow::anyhow!(
            "{}. Run `cdp-ledger init` to create a ledger in {}",
            e,
            app.config().data_dir.display()
        )
    })?;
    prepare(cli, &mut protocol)?;
    Ok(protocol)
}

/// Apply the global `--block` and `--price` flags
fn prepare(cli: &Cli, protocol: &mut Protocol<AnyStore>) -> anyhow::Result<()> {
    if let Some(height) = cli.block {
        protocol.advance_block(height)?;
    }
    if let Some(price) = &cli.price {
        protocol.set_price(TokenAmount::parse(price)?.units())?;
    }
    Ok(())
}

fn commit(protocol: &Protocol<AnyStore>) -> anyhow::Result<LedgerMeta> {
    let spinner = create_spinner("Saving ledger...");
    let saved = protocol.check_invariants().and_then(|_| protocol.save());
    spinner.finish_and_clear();
    let meta = saved?;
    tracing::debug!(
        block_height = meta.block_height,
        pool_hash = %meta.pool_hash,
        ledger_hash = %meta.ledger_hash,
        "ledger saved"
    );
    Ok(meta)
}

fn parse_position(id: &str) -> anyhow::Result<PositionId> {
    PositionId::from_hex(id).map_err(|e| anyhow::anyhow!("Invalid position id: {}", e))
}
