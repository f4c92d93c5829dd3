use rust_decimal::Decimal;
use std::collections::HashSet;
use std::str::FromStr;
use std::sync::Arc;

use crate::error::BotError;
use crate::notify::{Event, Notifier};
use crate::settings::{ConfigSnapshot, ConfigStore};
use crate::Result;

/// Operator command, parsed from a chat-style line such as `/set_threshold 1.5`
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    ShowConfig,
    SetArbitrageThreshold(Decimal),
    SetOrderSize(Decimal),
    SetBreakout(Decimal),
    SetDrop(Decimal),
    SetTrailing(Decimal),
    SetLimitOffset(Decimal),
    SetWindow(usize),
}

const USAGE: &str = "\
/config - show current settings
/set_threshold <pct> - arbitrage threshold
/set_quantity <size> - order size
/set_breakout <pct> - breakout threshold
/set_drop <pct> - defensive drop threshold
/set_trailing <pct> - trailing stop distance
/set_offset <pct> - limit order offset
/set_window <n> - moving average window";

impl Command {
    pub fn parse(line: &str) -> Result<Self> {
        let mut parts = line.split_whitespace();
        let name = parts
            .next()
            .ok_or_else(|| BotError::Command("empty command".into()))?;
        let arg = parts.next();
        if parts.next().is_some() {
            return Err(BotError::Command(format!("too many arguments to {}", name)));
        }

        let command = match name {
            "/start" | "/help" => Command::Help,
            "/config" => Command::ShowConfig,
            "/set_threshold" => Command::SetArbitrageThreshold(decimal_arg(name, arg)?),
            "/set_quantity" => Command::SetOrderSize(decimal_arg(name, arg)?),
            "/set_breakout" => Command::SetBreakout(decimal_arg(name, arg)?),
            "/set_drop" => Command::SetDrop(decimal_arg(name, arg)?),
            "/set_trailing" => Command::SetTrailing(decimal_arg(name, arg)?),
            "/set_offset" => Command::SetLimitOffset(decimal_arg(name, arg)?),
            "/set_window" => {
                let raw = arg.ok_or_else(|| BotError::Command(format!("usage: {} <n>", name)))?;
                let n = raw
                    .parse::<usize>()
                    .map_err(|_| BotError::Command(format!("{} is not a whole number", raw)))?;
                Command::SetWindow(n)
            }
            other => return Err(BotError::Command(format!("unknown command {}", other))),
        };

        Ok(command)
    }

    fn apply(&self, cfg: &mut ConfigSnapshot) {
        match *self {
            Command::SetArbitrageThreshold(v) => cfg.arbitrage_threshold_pct = v,
            Command::SetOrderSize(v) => cfg.order_size = v,
            Command::SetBreakout(v) => cfg.breakout_threshold_pct = v,
            Command::SetDrop(v) => cfg.drop_threshold_pct = v,
            Command::SetTrailing(v) => cfg.trailing_distance_pct = v,
            Command::SetLimitOffset(v) => cfg.limit_offset_pct = v,
            Command::SetWindow(n) => cfg.ma_window = n,
            Command::Help | Command::ShowConfig => {}
        }
    }
}

fn decimal_arg(name: &str, arg: Option<&str>) -> Result<Decimal> {
    let raw = arg.ok_or_else(|| BotError::Command(format!("usage: {} <value>", name)))?;
    Decimal::from_str(raw).map_err(|_| BotError::Command(format!("{} is not a number", raw)))
}

type Authorizer = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Single entry point for operator commands
///
/// Authorization is decided here, once, before anything is parsed or written.
#[derive(Clone)]
pub struct CommandHandler {
    store: ConfigStore,
    notifier: Notifier,
    authorize: Authorizer,
}

impl CommandHandler {
    pub fn new<F>(store: ConfigStore, notifier: Notifier, authorize: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            store,
            notifier,
            authorize: Arc::new(authorize),
        }
    }

    /// Allow only the listed operators
    pub fn with_operators(store: ConfigStore, notifier: Notifier, operators: &[String]) -> Self {
        let allowed: HashSet<String> = operators.iter().cloned().collect();
        Self::new(store, notifier, move |user| allowed.contains(user))
    }

    /// Run one command line on behalf of `user`, returning the reply text
    pub async fn handle(&self, user: &str, line: &str) -> Result<String> {
        if !(self.authorize)(user) {
            tracing::warn!(user = %user, "Rejected command from unauthorized user");
            return Err(BotError::Unauthorized(user.to_string()));
        }

        let command = Command::parse(line)?;

        match command {
            Command::Help => Ok(USAGE.to_string()),
            Command::ShowConfig => Ok(render(&self.store.snapshot(), self.store.version())),
            write => {
                let (version, snapshot) = self.store.update(|cfg| write.apply(cfg))?;
                tracing::info!(user = %user, command = ?write, version, "Configuration updated");

                self.notifier
                    .send(Event::ConfigChanged {
                        version,
                        snapshot: (*snapshot).clone(),
                    })
                    .await;

                Ok(format!("Updated.\n{}", render(&snapshot, version)))
            }
        }
    }
}

fn render(cfg: &ConfigSnapshot, version: u64) -> String {
    format!(
        "Configuration v{}\n\
         - moving average window: {}\n\
         - breakout threshold: {}%\n\
         - drop threshold: {}%\n\
         - trailing distance: {}%\n\
         - limit offset: {}%\n\
         - order size: {}\n\
         - arbitrage threshold: {}%",
        version,
        cfg.ma_window,
        cfg.breakout_threshold_pct,
        cfg.drop_threshold_pct,
        cfg.trailing_distance_pct,
        cfg.limit_offset_pct,
        cfg.order_size,
        cfg.arbitrage_threshold_pct
    )
}
