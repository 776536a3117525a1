use saga_common::{Map, Value};

/// Reserved top-level key carrying the tree's schema version.
pub const SCHEMA_VERSION_KEY: &str = "_schema_version";

type MigrationFn = Box<dyn Fn(&mut Map) + Send + Sync>;

struct Migration {
    version: u32,
    name: &'static str,
    run: MigrationFn,
}

/// Ordered set of one-time schema migrations.
///
/// Built once at startup and handed to whatever loads trees. Each step runs
/// only for trees whose version tag is below the step's version, and steps
/// are expected to use [`set_default`] so existing values are never replaced.
#[derive(Default)]
pub struct MigrationRegistry {
    steps: Vec<Migration>,
}

impl std::fmt::Debug for MigrationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|m| (m.version, m.name)))
            .finish()
    }
}

impl MigrationRegistry {
    /// Registry with no steps; target version 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in steps for campaign state trees.
    pub fn standard() -> Self {
        let mut reg = Self::new();
        reg.register(1, "core collections", |tree| {
            set_default(tree, "turn", Value::Int(0));
            for key in ["entities", "structures", "stockpiles", "flags"] {
                set_default(tree, key, Value::map());
            }
            for key in ["event_log", "timeline"] {
                set_default(tree, key, Value::List(Vec::new()));
            }
        });
        reg.register(2, "trade and scheduling", |tree| {
            set_default(tree, "trade_routes", Value::map());
            set_default(tree, "scheduled_events", Value::map());
        });
        reg.register(3, "journals and logs", |tree| {
            set_default(tree, "entity_journals", Value::map());
            for key in ["recent_motifs", "hazard_log", "combat_log", "story_progress"] {
                set_default(tree, key, Value::List(Vec::new()));
            }
        });
        reg
    }

    /// Add a step. Steps are kept sorted by version.
    pub fn register<F>(&mut self, version: u32, name: &'static str, run: F) -> &mut Self
    where
        F: Fn(&mut Map) + Send + Sync + 'static,
    {
        let at = self.steps.partition_point(|m| m.version <= version);
        self.steps.insert(
            at,
            Migration {
                version,
                name,
                run: Box::new(run),
            },
        );
        self
    }

    /// Highest registered version.
    pub fn target_version(&self) -> u32 {
        self.steps.last().map_or(0, |m| m.version)
    }

    /// Run every pending step and stamp the tree with the target version.
    ///
    /// Returns the number of steps that ran.
    pub fn migrate(&self, tree: &mut Map) -> usize {
        let from = version_of(tree);
        let mut ran = 0;
        for step in self.steps.iter().filter(|m| m.version > from) {
            tracing::debug!(version = step.version, name = step.name, "running schema migration");
            (step.run)(tree);
            ran += 1;
        }
        // Never move a tag backwards if the tree came from a newer build.
        let stamped = from.max(self.target_version());
        tree.insert(SCHEMA_VERSION_KEY.to_string(), Value::Int(i64::from(stamped)));
        ran
    }
}

/// The tree's schema version tag, 0 when absent or malformed.
pub fn version_of(tree: &Map) -> u32 {
    tree.get(SCHEMA_VERSION_KEY)
        .and_then(Value::as_i64)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(0)
}

/// Insert `value` under `key` only when the key is absent.
pub fn set_default(tree: &mut Map, key: &str, value: Value) {
    tree.entry(key.to_string()).or_insert(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_registry_targets_latest_step() {
        let reg = MigrationRegistry::standard();
        assert_eq!(reg.target_version(), 3);
    }

    #[test]
    fn migrate_populates_defaults_and_stamps() {
        let reg = MigrationRegistry::standard();
        let mut tree = Map::new();
        assert_eq!(reg.migrate(&mut tree), 3);
        assert_eq!(version_of(&tree), 3);
        assert_eq!(tree.get("turn"), Some(&Value::Int(0)));
        assert_eq!(tree.get("hazard_log"), Some(&Value::List(Vec::new())));
    }

    #[test]
    fn migrate_never_overwrites() {
        let reg = MigrationRegistry::standard();
        let mut tree = Map::new();
        tree.insert("turn".into(), Value::Int(41));
        tree.insert("timeline".into(), Value::from(vec![Value::from("founding")]));
        reg.migrate(&mut tree);
        assert_eq!(tree.get("turn"), Some(&Value::Int(41)));
        assert_eq!(
            tree.get("timeline"),
            Some(&Value::from(vec![Value::from("founding")]))
        );
    }

    #[test]
    fn only_pending_steps_run() {
        let reg = MigrationRegistry::standard();
        let mut tree = Map::new();
        tree.insert(SCHEMA_VERSION_KEY.into(), Value::Int(2));
        assert_eq!(reg.migrate(&mut tree), 1);
        assert!(tree.contains_key("entity_journals"));
        assert!(!tree.contains_key("trade_routes"));
        assert_eq!(reg.migrate(&mut tree), 0);
    }

    #[test]
    fn newer_tag_is_not_downgraded() {
        let reg = MigrationRegistry::standard();
        let mut tree = Map::new();
        tree.insert(SCHEMA_VERSION_KEY.into(), Value::Int(9));
        reg.migrate(&mut tree);
        assert_eq!(version_of(&tree), 9);
    }

    #[test]
    fn register_keeps_version_order() {
        let mut reg = MigrationRegistry::new();
        reg.register(5, "late", |t| set_default(t, "late", Value::Int(5)));
        reg.register(2, "early", |t| set_default(t, "early", Value::Int(2)));
        assert_eq!(reg.target_version(), 5);
        let mut tree = Map::new();
        tree.insert(SCHEMA_VERSION_KEY.into(), Value::Int(3));
        reg.migrate(&mut tree);
        assert!(tree.contains_key("late"));
        assert!(!tree.contains_key("early"));
    }
}
