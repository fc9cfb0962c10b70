//! Local BLAST+ backend
//!
//! Runs one BLAST+ process per query against a configured database, with the
//! query fed as FASTA on stdin and the XML report (`-outfmt 5`) read from
//! stdout. The process is killed when the future is dropped, which covers
//! both cancellation and the hard timeout.

use super::traits::{Backend, BackendKind, RawResult};
use crate::config::LocalSettings;
use crate::error::BackendError;
use crate::query::{SearchParameters, SearchProgram, SequenceQuery};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// BLAST+ subprocess adapter
#[derive(Debug, Clone)]
pub struct LocalBackend {
    database: PathBuf,
    bin_dir: Option<PathBuf>,
    timeout: Duration,
    num_threads: u32,
}

impl LocalBackend {
    pub fn new(database: impl Into<PathBuf>) -> Self {
        let defaults = LocalSettings::default();
        Self {
            database: database.into(),
            bin_dir: None,
            timeout: Duration::from_secs(defaults.timeout_secs),
            num_threads: defaults.num_threads,
        }
    }

    /// Build from settings. Returns `None` when no database is configured.
    pub fn from_settings(settings: &LocalSettings) -> Option<Self> {
        let database = settings.database.clone()?;
        Some(Self {
            database,
            bin_dir: settings.bin_dir.clone(),
            timeout: Duration::from_secs(settings.timeout_secs),
            num_threads: settings.num_threads.max(1),
        })
    }

    pub fn with_bin_dir(mut self, bin_dir: impl Into<PathBuf>) -> Self {
        self.bin_dir = Some(bin_dir.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn database(&self) -> &Path {
        &self.database
    }

    fn binary(&self, program: SearchProgram) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(program.as_str()),
            None => PathBuf::from(program.as_str()),
        }
    }

    /// Command-line arguments for one search
    pub fn arguments(&self, query: &SequenceQuery, params: &SearchParameters) -> Vec<String> {
        let mut args = vec![
            "-db".to_string(),
            self.database.display().to_string(),
            "-outfmt".to_string(),
            "5".to_string(),
            "-evalue".to_string(),
            params.evalue.to_string(),
            "-max_target_seqs".to_string(),
            params.hitlist_size.to_string(),
            "-num_threads".to_string(),
            self.num_threads.to_string(),
        ];

        if query.program == SearchProgram::Blastn {
            let task = if params.megablast { "megablast" } else { "blastn" };
            args.extend(["-task".to_string(), task.to_string()]);
        }
        if let Some(word_size) = params.word_size {
            args.extend(["-word_size".to_string(), word_size.to_string()]);
        }
        if let Some(reward) = params.reward {
            args.extend(["-reward".to_string(), reward.to_string()]);
        }
        if let Some(penalty) = params.penalty {
            args.extend(["-penalty".to_string(), penalty.to_string()]);
        }
        if let Some(max_hsps) = params.max_hsps {
            args.extend(["-max_hsps".to_string(), max_hsps.to_string()]);
        }
        if let Some(filter) = &params.filter {
            let flag = if query.program.nucleotide_query() { "-dust" } else { "-seg" };
            let value = if filter.contains('L') { "yes" } else { "no" };
            args.extend([flag.to_string(), value.to_string()]);
        }
        if let Some(matrix) = &params.matrix {
            if query.program != SearchProgram::Blastn {
                args.extend(["-matrix".to_string(), matrix.clone()]);
            }
        }
        args
    }

    /// Whether any volume of the database prefix exists on disk
    fn database_present(&self) -> bool {
        let Some(prefix) = self.database.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        let dir = match self.database.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return false;
        };
        let volume_prefix = format!("{prefix}.");
        entries
            .flatten()
            .any(|entry| entry.file_name().to_string_lossy().starts_with(&volume_prefix))
    }

    /// `blastn -version` output, if the binary runs
    pub async fn version(&self) -> Option<String> {
        let probe = Command::new(self.binary(SearchProgram::Blastn))
            .arg("-version")
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(VERSION_PROBE_TIMEOUT, probe).await {
            Ok(Ok(output)) if output.status.success() => {
                let text = String::from_utf8_lossy(&output.stdout);
                Some(text.lines().next().unwrap_or_default().trim().to_string())
            }
            Ok(Ok(output)) => {
                debug!("BLAST+ version probe exited with {}", output.status);
                None
            }
            Ok(Err(e)) => {
                debug!("BLAST+ version probe failed: {}", e);
                None
            }
            Err(_) => {
                debug!("BLAST+ version probe timed out");
                None
            }
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn name(&self) -> &str {
        "blast+"
    }

    async fn is_available(&self) -> bool {
        if !self.database_present() {
            debug!("Local database not found: {}", self.database.display());
            return false;
        }
        match self.version().await {
            Some(version) => {
                debug!("Local BLAST+ available: {}", version);
                true
            }
            None => false,
        }
    }

    async fn execute(
        &self,
        query: &SequenceQuery,
        params: &SearchParameters,
        cancel: &CancellationToken,
    ) -> Result<RawResult, BackendError> {
        if cancel.is_cancelled() {
            return Err(BackendError::Cancelled(BackendKind::Local));
        }

        let program = query.program;
        let binary = self.binary(program);
        debug!(query = %query.id, binary = %binary.display(), "spawning local search");

        let mut child = Command::new(&binary)
            .args(self.arguments(query, params))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BackendError::permanent(
                    BackendKind::Local,
                    format!("failed to start {}: {e}", binary.display()),
                )
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            let fasta = query.to_fasta();
            let id = query.id.clone();
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(fasta.as_bytes()).await {
                    debug!(query = %id, "failed to write query to {program}: {e}");
                }
            });
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(query = %query.id, "cancelling local search");
                return Err(BackendError::Cancelled(BackendKind::Local));
            }
            result = tokio::time::timeout(self.timeout, child.wait_with_output()) => match result {
                Err(_) => {
                    warn!(query = %query.id, "{program} timed out after {:?}", self.timeout);
                    return Err(BackendError::transient(
                        BackendKind::Local,
                        format!("{program} timed out after {}s", self.timeout.as_secs_f64()),
                    ));
                }
                Ok(Err(e)) => {
                    return Err(BackendError::transient(
                        BackendKind::Local,
                        format!("failed to collect {program} output: {e}"),
                    ));
                }
                Ok(Ok(output)) => output,
            },
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(BackendError::Permanent {
                backend: BackendKind::Local,
                message: format!("{program} exited abnormally"),
                exit_code: output.status.code(),
                diagnostics: Some(stderr),
            });
        }

        if !stdout.contains("<BlastOutput") {
            return Err(BackendError::Permanent {
                backend: BackendKind::Local,
                message: format!("{program} produced no BLAST XML report"),
                exit_code: output.status.code(),
                diagnostics: Some(stderr),
            });
        }

        Ok(RawResult::new(BackendKind::Local, stdout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(sequence: &str) -> SequenceQuery {
        SequenceQuery::new(
            "sample",
            sequence,
            SearchProgram::Blastn,
            "16S",
            SearchParameters::default(),
        )
    }

    #[test]
    fn test_arguments() {
        let backend = LocalBackend::new("/data/db/16S");
        let args = backend.arguments(&query("ACGT"), &SearchParameters::default());
        let joined = args.join(" ");
        assert!(joined.starts_with("-db /data/db/16S -outfmt 5"));
        assert!(joined.contains("-task megablast"));
        assert!(joined.contains("-word_size 28"));
        assert!(joined.contains("-max_target_seqs 50"));
        assert!(joined.contains("-max_hsps 1"));
    }

    #[test]
    fn test_from_settings_requires_database() {
        assert!(LocalBackend::from_settings(&LocalSettings::default()).is_none());
    }

    #[tokio::test]
    async fn test_missing_database_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let backend = LocalBackend::new(dir.path().join("absent"));
        assert!(!backend.is_available().await);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::time::Instant;

        const REPORT: &str = "<?xml version=\"1.0\"?>\n<BlastOutput><BlastOutput_program>blastn</BlastOutput_program></BlastOutput>\n";

        fn install_script(dir: &Path, name: &str, body: &str) {
            let path = dir.join(name);
            std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
            std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        fn backend_with(dir: &Path, body: &str) -> LocalBackend {
            install_script(dir, "blastn", body);
            std::fs::write(dir.join("db.nsq"), b"").unwrap();
            LocalBackend::new(dir.join("db")).with_bin_dir(dir)
        }

        #[tokio::test]
        async fn test_available_with_database_and_binary() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_with(dir.path(), "echo 'blastn: 2.14.0+'");
            assert!(backend.is_available().await);
            assert_eq!(backend.version().await.as_deref(), Some("blastn: 2.14.0+"));
        }

        #[tokio::test]
        async fn test_successful_search_reads_stdin() {
            let dir = tempfile::tempdir().unwrap();
            let body = format!("cat > \"$(dirname \"$0\")/query.fa\"\nprintf '%s' '{REPORT}'");
            let backend = backend_with(dir.path(), &body);
            let cancel = CancellationToken::new();

            let result = backend
                .execute(&query("acgtacgt"), &SearchParameters::default(), &cancel)
                .await
                .unwrap();

            assert_eq!(result.backend, BackendKind::Local);
            assert!(result.body.contains("<BlastOutput>"));
            let fed = std::fs::read_to_string(dir.path().join("query.fa")).unwrap();
            assert_eq!(fed, ">sample\nACGTACGT\n");
        }

        #[tokio::test]
        async fn test_nonzero_exit_is_permanent() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_with(
                dir.path(),
                "echo 'BLAST Database error: No alias or index file found' >&2\nexit 2",
            );
            let cancel = CancellationToken::new();

            let err = backend
                .execute(&query("ACGT"), &SearchParameters::default(), &cancel)
                .await
                .unwrap_err();

            match err {
                BackendError::Permanent {
                    exit_code,
                    diagnostics,
                    ..
                } => {
                    assert_eq!(exit_code, Some(2));
                    assert!(diagnostics.unwrap().contains("No alias or index file"));
                }
                other => panic!("unexpected error: {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_malformed_output_is_permanent() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_with(dir.path(), "echo 'not xml'");
            let cancel = CancellationToken::new();

            let err = backend
                .execute(&query("ACGT"), &SearchParameters::default(), &cancel)
                .await
                .unwrap_err();
            assert!(!err.is_transient());
            assert!(err.to_string().contains("no BLAST XML report"));
        }

        #[tokio::test]
        async fn test_timeout_is_transient() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_with(dir.path(), "exec sleep 30")
                .with_timeout(Duration::from_millis(200));
            let cancel = CancellationToken::new();

            let start = Instant::now();
            let err = backend
                .execute(&query("ACGT"), &SearchParameters::default(), &cancel)
                .await
                .unwrap_err();
            assert!(err.is_transient());
            assert!(start.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn test_cancellation_terminates_process() {
            let dir = tempfile::tempdir().unwrap();
            let backend = backend_with(dir.path(), "exec sleep 30");
            let cancel = CancellationToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                trigger.cancel();
            });

            let start = Instant::now();
            let err = backend
                .execute(&query("ACGT"), &SearchParameters::default(), &cancel)
                .await
                .unwrap_err();
            assert!(err.is_cancelled());
            assert!(start.elapsed() < Duration::from_secs(5));
        }
    }
}
