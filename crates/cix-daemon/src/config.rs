//! Daemon configuration.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Boolean toggles from the command line.
#[derive(Clone, Debug, Default)]
pub struct OptionFlags {
    pub unlimited_errors: bool,
    pub wall: bool,
    pub spell_checking: bool,
    pub clear_projects: bool,
    pub no_startup_current_project: bool,
    pub no_file_manager_watch: bool,
}

#[derive(Clone, Debug)]
pub struct Options {
    /// Indexer parallelism; also sizes the preprocess pool.
    pub job_count: usize,
    /// Minutes of idle before non-current projects unload. Zero disables.
    pub unload_timer_minutes: u64,
    /// How long a dispatched job may stay unanswered before it is
    /// re-queued.
    pub reschedule_timeout: Duration,
    /// Debounce between indexing quiescing and the project hitting disk.
    pub sync_timeout: Duration,
    pub multicast_address: Option<String>,
    pub multicast_port: u16,
    pub multicast_ttl: u32,
    /// Peer job-pull listener; zero disables remote execution.
    pub tcp_port: u16,
    pub multicast_forwards: Vec<(String, u16)>,
    pub socket_file: PathBuf,
    pub data_dir: PathBuf,
    pub include_paths: Vec<PathBuf>,
    pub default_arguments: Vec<String>,
    /// Glob list preventing indexing.
    pub exclude_filters: Vec<String>,
    pub ignored_compilers: BTreeSet<PathBuf>,
    /// Command used to launch the external indexer.
    pub indexer_command: PathBuf,
    /// Live parses kept by the completion thread.
    pub completion_cache_size: usize,
    pub flags: OptionFlags,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            job_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            unload_timer_minutes: 0,
            reschedule_timeout: Duration::from_secs(15),
            sync_timeout: Duration::from_secs(2),
            multicast_address: None,
            multicast_port: 0,
            multicast_ttl: 0,
            tcp_port: 0,
            multicast_forwards: Vec::new(),
            socket_file: PathBuf::from("/tmp/cixd.socket"),
            data_dir: PathBuf::from("/tmp/cix"),
            include_paths: Vec::new(),
            default_arguments: Vec::new(),
            exclude_filters: Vec::new(),
            ignored_compilers: BTreeSet::new(),
            indexer_command: PathBuf::from("cix-indexer"),
            completion_cache_size: 10,
            flags: OptionFlags::default(),
        }
    }
}

impl Options {
    /// Flags appended to every admitted compile, derived from the toggles.
    pub fn derived_arguments(&self) -> Vec<String> {
        let mut out = self.default_arguments.clone();
        if self.flags.unlimited_errors {
            out.push("-ferror-limit=0".to_string());
        }
        if self.flags.wall {
            out.push("-Wall".to_string());
        }
        if self.flags.spell_checking {
            out.push("-fspell-checking".to_string());
        }
        out
    }

    pub fn is_excluded(&self, path: &Path) -> bool {
        let candidate = path.display().to_string();
        self.exclude_filters
            .iter()
            .any(|filter| wildcard_match(filter, &candidate))
    }

    pub fn is_ignored_compiler(&self, compiler: &Path) -> bool {
        self.ignored_compilers.contains(compiler)
    }
}

/// `*`-only wildcard match, anchored at both ends.
pub fn wildcard_match(pattern: &str, candidate: &str) -> bool {
    fn inner(pattern: &[u8], candidate: &[u8]) -> bool {
        match (pattern.first(), candidate.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&pattern[1..], candidate)
                    || (!candidate.is_empty() && inner(pattern, &candidate[1..]))
            }
            (Some(p), Some(c)) if p == c => inner(&pattern[1..], &candidate[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), candidate.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wildcard_matching() {
        assert!(wildcard_match("*/generated/*", "/src/generated/foo.cpp"));
        assert!(wildcard_match("*.pb.cc", "proto/foo.pb.cc"));
        assert!(!wildcard_match("*.pb.cc", "proto/foo.cc"));
        assert!(wildcard_match("*", "anything"));
        assert!(!wildcard_match("", "x"));
    }

    #[test]
    fn exclude_filters_apply() {
        let options = Options {
            exclude_filters: vec!["*/third_party/*".into()],
            ..Options::default()
        };
        assert!(options.is_excluded(Path::new("/src/third_party/x.cpp")));
        assert!(!options.is_excluded(Path::new("/src/lib/x.cpp")));
    }

    #[test]
    fn derived_arguments_follow_flags() {
        let options = Options {
            default_arguments: vec!["-DX".into()],
            flags: OptionFlags {
                wall: true,
                unlimited_errors: true,
                ..OptionFlags::default()
            },
            ..Options::default()
        };
        assert_eq!(
            options.derived_arguments(),
            vec!["-DX", "-ferror-limit=0", "-Wall"]
        );
    }
}
