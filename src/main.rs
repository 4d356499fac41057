use std::{error::Error, path::PathBuf, process, sync::Arc};

use clap::{Parser, Subcommand};
use log::{debug, error};
use serde::Serialize;

use stakenet::{
    clock::{Clock, ManualClock, SystemClock},
    config::Config,
    rates,
    staking::parse_lock_duration,
    store::{MemoryStore, SettingsPatch},
    Ledger, RegisterRequest,
};

type CliLedger = Ledger<MemoryStore, Arc<dyn Clock>>;

#[derive(Parser)]
#[command(
    name = "stakenet",
    version,
    about = "Referral network and staking ledger over a JSON state file"
)]
struct Cli {
    /// JSON config file
    #[arg(long, env = "STAKENET_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// State snapshot (overrides the config)
    #[arg(long, env = "STAKENET_STATE", global = true)]
    state: Option<PathBuf>,
    /// Log filter, e.g. `debug` or `stakenet=trace`
    #[arg(long, global = true)]
    log_level: Option<String>,
    /// Pin the clock to this Unix time in milliseconds
    #[arg(long, global = true)]
    now_ms: Option<u64>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register a wallet, optionally under a referrer's code
    Register {
        #[arg(long)]
        wallet: String,
        #[arg(long)]
        referrer: Option<String>,
        /// Requested own referral code
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        messaging_id: Option<String>,
    },
    /// Link an external messaging handle to an account
    LinkMessaging { account: String, handle: String },
    /// Open a stake (lock: 3m, 6m or 12m)
    Stake {
        account: String,
        #[arg(long)]
        amount: u64,
        #[arg(long, default_value = "3m")]
        lock: String,
    },
    /// List an account's stakes
    Stakes { account: String },
    Unstake { stake: String },
    EmergencyUnstake { stake: String },
    /// Credit upline commission on a settled amount from `account`
    Accrue {
        account: String,
        #[arg(long)]
        base: u64,
    },
    /// Claim pending referral earnings
    Claim { account: String },
    /// Show or change global settings
    Settings {
        #[arg(long)]
        paused: Option<bool>,
        #[arg(long)]
        emergency_unstake: Option<bool>,
    },
    /// Show an account by id, wallet (0x…) or referral code
    Show { account: String },
    /// Downline per level
    Team { account: String },
    /// Commission and yield schedules
    Rates,
    /// Report aggregate drift without repairing it
    Audit,
    /// Recompute and repair all aggregates
    Recompute,
    /// Recompute direct-referral counters only
    RecalcReferrals,
    /// Print the state root of the snapshot
    Root,
}

impl Command {
    fn is_read_only(&self) -> bool {
        matches!(
            self,
            Command::Show { .. }
                | Command::Team { .. }
                | Command::Rates
                | Command::Audit
                | Command::Root
                | Command::Settings {
                    paused: None,
                    emergency_unstake: None
                }
        )
    }
}

#[derive(Serialize)]
struct RateRow {
    level: u8,
    rate: String,
}

fn print_json<T: Serialize>(value: &T) -> Result<(), Box<dyn Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_logging(flag: Option<&str>, config: &Config) {
    let mut builder = match flag {
        Some(filter) => {
            let mut b = env_logger::Builder::new();
            b.parse_filters(filter);
            b
        }
        None => env_logger::Builder::from_env(
            env_logger::Env::default().default_filter_or(config.log_level.as_str()),
        ),
    };
    builder.format_timestamp_millis().init();
}

fn show_cmd(ledger: &CliLedger, key: &str) -> Result<(), Box<dyn Error>> {
    let account = if key.starts_with("0x") || key.starts_with("0X") {
        ledger.account_by_wallet(key)?
    } else if key.starts_with("acct_") {
        ledger.account(key)?
    } else {
        ledger.account_by_referral_code(key)?
    };
    print_json(&account)
}

fn rates_cmd() -> Result<(), Box<dyn Error>> {
    let commission: Vec<RateRow> = rates::commission_schedule()
        .into_iter()
        .map(|tier| RateRow {
            level: tier.level,
            rate: rates::format_bps(tier.rate_bps),
        })
        .collect();
    print_json(&serde_json::json!({
        "commission": commission,
        "yield": rates::yield_schedule(),
    }))
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };
    if let Some(state) = cli.state {
        config.state_file = state;
    }
    init_logging(cli.log_level.as_deref(), &config);

    let clock: Arc<dyn Clock> = match cli.now_ms {
        Some(now) => Arc::new(ManualClock::new(now)),
        None => Arc::new(SystemClock),
    };
    let store = MemoryStore::load(&config.state_file)?;
    debug!("loaded state from {}", config.state_file.display());
    let ledger: CliLedger =
        Ledger::new(store, clock).with_referral_code_len(config.referral_code_len);
    let read_only = cli.command.is_read_only();

    match cli.command {
        Command::Register {
            wallet,
            referrer,
            code,
            messaging_id,
        } => {
            let account = ledger.register(RegisterRequest {
                wallet_address: wallet,
                referrer_code: referrer,
                referral_code: code,
                messaging_id,
            })?;
            print_json(&account)?;
        }
        Command::LinkMessaging { account, handle } => {
            print_json(&ledger.link_messaging_id(&account, &handle)?)?;
        }
        Command::Stake {
            account,
            amount,
            lock,
        } => {
            let lock = parse_lock_duration(&lock)?;
            print_json(&ledger.create_stake(&account, amount, lock)?)?;
        }
        Command::Stakes { account } => print_json(&ledger.stakes_for(&account)?)?,
        Command::Unstake { stake } => print_json(&ledger.unstake(&stake)?)?,
        Command::EmergencyUnstake { stake } => print_json(&ledger.emergency_unstake(&stake)?)?,
        Command::Accrue { account, base } => {
            print_json(&ledger.accrue_referral_commission(&account, base)?)?
        }
        Command::Claim { account } => print_json(&ledger.claim_referral_earnings(&account)?)?,
        Command::Settings {
            paused,
            emergency_unstake,
        } => {
            if paused.is_none() && emergency_unstake.is_none() {
                print_json(&ledger.settings())?;
            } else {
                let settings = ledger.update_settings(SettingsPatch {
                    paused,
                    emergency_unstake_enabled: emergency_unstake,
                    updated_at: None,
                })?;
                print_json(&settings)?;
            }
        }
        Command::Show { account } => show_cmd(&ledger, &account)?,
        Command::Team { account } => print_json(&ledger.referral_summary(&account)?)?,
        Command::Rates => rates_cmd()?,
        Command::Audit => print_json(&ledger.audit_aggregates())?,
        Command::Recompute => print_json(&ledger.recompute_aggregates()?)?,
        Command::RecalcReferrals => print_json(&ledger.recalculate_referrals()?)?,
        Command::Root => println!("{}", ledger.read(|store| hex::encode(store.state_root()))),
    }

    if !read_only {
        ledger.read(|store| store.save(&config.state_file))?;
        debug!("saved state to {}", config.state_file.display());
    }
    Ok(())
}

fn main() {
    let cli = Cli::parse();
    if let Err(err) = run(cli) {
        error!("{err}");
        eprintln!("error: {err}");
        process::exit(2);
    }
}
