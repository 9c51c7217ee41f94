/// Volumes the caller asked to leave out.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SkipVolumes {
    /// Every catalog volume is skipped; only extra volumes are backed up.
    All,
    Named(Vec<String>),
    #[default]
    None,
}

impl SkipVolumes {
    /// The sentinel applies only when `all` is the single entry.
    pub fn from_list(list: Vec<String>) -> Self {
        if list.len() == 1 && list[0] == "all" {
            SkipVolumes::All
        } else if list.is_empty() {
            SkipVolumes::None
        } else {
            SkipVolumes::Named(list)
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        match self {
            SkipVolumes::All => true,
            SkipVolumes::Named(names) => names.iter().any(|n| n == name),
            SkipVolumes::None => false,
        }
    }

    pub fn names(&self) -> &[String] {
        match self {
            SkipVolumes::Named(names) => names,
            _ => &[],
        }
    }
}

/// Options for one backup or restore invocation.
#[derive(Debug, Clone, Default)]
pub struct Options {
    pub skip_volumes: SkipVolumes,
    pub extra_volumes: Vec<String>,
    pub skip_database: bool,
    pub skip_images: bool,
    pub skip_config: bool,
    pub no_restart: bool,
    pub dry_run: bool,
    pub force: bool,
    /// Restore only: leave volumes already present alone (`--continue`).
    pub skip_existing: bool,
    pub skip_verify: bool,
}
