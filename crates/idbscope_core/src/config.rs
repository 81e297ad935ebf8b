//! Session configuration.

/// Configuration for a [`crate::Session`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Collections ensured by the schema migrator during every upgrade.
    pub collections: Vec<String>,

    /// Field holding the primary key of every record.
    pub key_path: String,

    /// Maximum number of events kept in the event log.
    pub max_events: usize,

    /// Whether to select the first collection when a connection opens.
    pub auto_select: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            collections: Vec::new(),
            key_path: "id".to_string(),
            max_events: 10_000,
            auto_select: true,
        }
    }
}

impl SessionConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a collection to ensure during upgrades.
    #[must_use]
    pub fn collection(mut self, name: impl Into<String>) -> Self {
        self.collections.push(name.into());
        self
    }

    /// Replaces the collections to ensure during upgrades.
    #[must_use]
    pub fn collections<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = names.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the primary key field.
    #[must_use]
    pub fn key_path(mut self, key_path: impl Into<String>) -> Self {
        self.key_path = key_path.into();
        self
    }

    /// Sets the event log history bound.
    #[must_use]
    pub const fn max_events(mut self, max_events: usize) -> Self {
        self.max_events = max_events;
        self
    }

    /// Sets whether the first collection is selected on open.
    #[must_use]
    pub const fn auto_select(mut self, value: bool) -> Self {
        self.auto_select = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = SessionConfig::default();
        assert!(config.collections.is_empty());
        assert_eq!(config.key_path, "id");
        assert!(config.auto_select);
    }

    #[test]
    fn builder_pattern() {
        let config = SessionConfig::new()
            .collection("line-items")
            .collection("customers")
            .key_path("sku")
            .max_events(16)
            .auto_select(false);

        assert_eq!(config.collections, vec!["line-items", "customers"]);
        assert_eq!(config.key_path, "sku");
        assert_eq!(config.max_events, 16);
        assert!(!config.auto_select);

        let config = config.collections(["a"]);
        assert_eq!(config.collections, vec!["a"]);
    }
}
