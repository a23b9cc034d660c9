use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{bail, Context};
use teloxide::types::UserId;

/// Конфигурация процесса. Все три переменные обязательны:
/// без любой из них бот не стартует.
#[derive(Debug, Clone)]
pub struct Config {
    pub bot_token: String,
    pub admins: Admins,
    pub database_url: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            bot_token: require("BOT_TOKEN")?,
            admins: Admins::parse(&require("ADMIN_IDS")?)?,
            database_url: require("DATABASE_URL")?,
        })
    }
}

fn require(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{name} is not set"))
}

/// Список админов. Читается один раз на старте, на лету не перечитывается.
#[derive(Debug, Clone)]
pub struct Admins(Arc<HashSet<UserId>>);

impl Admins {
    /// Разбор строки вида "123, 456" из ADMIN_IDS.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut ids = HashSet::new();
        for part in raw.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let id: u64 = part
                .parse()
                .with_context(|| format!("ADMIN_IDS: bad id {part:?}"))?;
            ids.insert(UserId(id));
        }
        if ids.is_empty() {
            bail!("ADMIN_IDS is empty");
        }
        Ok(Self(Arc::new(ids)))
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.0.contains(&user)
    }
}
