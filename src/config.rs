use std::path::PathBuf;

/// Configuration for the knowledge base
#[derive(Debug, Clone)]
pub struct KbConfig {
    /// Directory holding snapshot files, the store journal and the lock file
    pub dir: PathBuf,

    /// Snapshot file for execution statistics (default: kb_statistics.stat)
    pub stat_file: String,

    /// Snapshot file for query texts (default: kb_query_texts.stat)
    pub text_file: String,

    /// Snapshot file for cached datasets (default: kb_data.stat)
    pub data_file: String,

    /// Journal of committed rows in the durable store (default: kb_store.journal)
    pub journal_file: String,

    /// Initial size of each arena segment (default: 1MB)
    pub arena_initial_size: usize,

    /// Upper bound an arena segment may grow to (default: 64MB)
    pub arena_max_size: usize,

    /// Whether a statement timeout policy is active. Datasets learned from
    /// timed-out statements are then kept in the shared cache (default: false)
    pub learn_statement_timeout: bool,

    /// Fsync the journal on every commit (default: true)
    pub sync_journal: bool,
}

impl Default for KbConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./knnbase"),
            stat_file: "kb_statistics.stat".to_string(),
            text_file: "kb_query_texts.stat".to_string(),
            data_file: "kb_data.stat".to_string(),
            journal_file: "kb_store.journal".to_string(),
            arena_initial_size: 1024 * 1024,    // 1MB
            arena_max_size: 64 * 1024 * 1024, // 64MB
            learn_statement_timeout: false,
            sync_journal: true,
        }
    }
}

impl KbConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the statistics snapshot file name
    pub fn stat_file(mut self, name: impl Into<String>) -> Self {
        self.stat_file = name.into();
        self
    }

    /// Set the query text snapshot file name
    pub fn text_file(mut self, name: impl Into<String>) -> Self {
        self.text_file = name.into();
        self
    }

    /// Set the dataset snapshot file name
    pub fn data_file(mut self, name: impl Into<String>) -> Self {
        self.data_file = name.into();
        self
    }

    /// Set the journal file name
    pub fn journal_file(mut self, name: impl Into<String>) -> Self {
        self.journal_file = name.into();
        self
    }

    /// Set the initial arena segment size
    pub fn arena_initial_size(mut self, size: usize) -> Self {
        self.arena_initial_size = size;
        self
    }

    /// Set the maximum arena segment size
    pub fn arena_max_size(mut self, size: usize) -> Self {
        self.arena_max_size = size;
        self
    }

    /// Enable or disable the statement timeout policy
    pub fn learn_statement_timeout(mut self, enabled: bool) -> Self {
        self.learn_statement_timeout = enabled;
        self
    }

    /// Enable or disable fsync on commit
    pub fn sync_journal(mut self, enabled: bool) -> Self {
        self.sync_journal = enabled;
        self
    }

    pub fn stat_path(&self) -> PathBuf {
        self.dir.join(&self.stat_file)
    }

    pub fn text_path(&self) -> PathBuf {
        self.dir.join(&self.text_file)
    }

    pub fn data_path(&self) -> PathBuf {
        self.dir.join(&self.data_file)
    }

    pub fn journal_path(&self) -> PathBuf {
        self.dir.join(&self.journal_file)
    }
}
