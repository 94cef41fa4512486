// Submission Materialiser (C4): cache, unpack, validate, and build a
// container image for a submission, reporting build status back via the
// repository.

use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::blob::BlobClient;
use crate::container;
use crate::db::Database;
use crate::error::ArenaError;

const MIN_ZIP_SIZE: u64 = 1024;
const KNOWN_LANGUAGES: &[&str] = &["py", "cpp", "cs", "lua", "java", "js", "ts"];

pub struct Materialiser<'a> {
    db: &'a Database,
    blob: &'a BlobClient,
    cache_root: PathBuf,
    dockerfile_root: PathBuf,
}

impl<'a> Materialiser<'a> {
    pub fn new(db: &'a Database, blob: &'a BlobClient, cache_root: PathBuf, dockerfile_root: PathBuf) -> Self {
        Materialiser {
            db,
            blob,
            cache_root,
            dockerfile_root,
        }
    }

    fn zip_path(&self, submission_id: i64) -> PathBuf {
        self.cache_root.join(format!("{submission_id}.zip"))
    }

    fn unpacked_dir(&self, submission_id: i64) -> PathBuf {
        self.cache_root.join(format!("{submission_id}"))
    }

    /// Build the submission into a runnable image, idempotently. On any
    /// submission-fatal failure, records the failure in the database and
    /// returns `SubmissionFailed`; transient errors during a sub-step are
    /// not caught here and propagate for the runner to retry at game level.
    pub async fn materialise(&self, submission_id: i64) -> Result<(), ArenaError> {
        match self.try_materialise(submission_id).await {
            Ok(()) => Ok(()),
            Err(ArenaError::SubmissionFailed { submission_id, reason }) => {
                self.report_prebuild_failure(submission_id, &reason).await
            }
            Err(other) => Err(other),
        }
    }

    async fn report_prebuild_failure(&self, submission_id: i64, reason: &str) -> Result<(), ArenaError> {
        warn!(submission_id, reason, "submission prebuild failed");
        let artifact = self.cache_root.join(format!("prebuild_failure_{submission_id}"));
        tokio::fs::write(&artifact, reason.as_bytes())
            .await
            .map_err(|e| ArenaError::Transient(crate::error::TransientError::from(e)))?;
        let url = self.blob.upload_file(&artifact, &format!("prebuild_failure_{submission_id}")).await?;
        self.db.set_submission_status(submission_id, "failed", Some(&url)).await?;
        crate::metrics::SUBMISSIONS_FAILED_TOTAL.inc();
        Err(ArenaError::SubmissionFailed {
            submission_id,
            reason: reason.to_string(),
        })
    }

    async fn try_materialise(&self, submission_id: i64) -> Result<(), ArenaError> {
        self.fetch_zip(submission_id).await?;
        let bot_dir = self.unpack(submission_id).await?;
        let language = self.validate(submission_id, &bot_dir).await?;
        self.install_dockerfile(submission_id, &bot_dir, &language).await?;
        self.build(submission_id, &bot_dir).await?;
        Ok(())
    }

    async fn fetch_zip(&self, submission_id: i64) -> Result<(), ArenaError> {
        let path = self.zip_path(submission_id);
        if let Ok(meta) = tokio::fs::metadata(&path).await {
            if meta.len() > MIN_ZIP_SIZE {
                return Ok(());
            }
        }
        let data = self.db.load_submission_blob(submission_id).await?;
        tokio::fs::create_dir_all(&self.cache_root)
            .await
            .map_err(|e| ArenaError::Transient(crate::error::TransientError::from(e)))?;
        tokio::fs::write(&path, &data)
            .await
            .map_err(|e| ArenaError::Transient(crate::error::TransientError::from(e)))?;
        Ok(())
    }

    async fn unpack(&self, submission_id: i64) -> Result<PathBuf, ArenaError> {
        let dir = self.unpacked_dir(submission_id);
        if dir.is_dir() {
            return Ok(dir);
        }
        let zip_path = self.zip_path(submission_id);
        let dir_for_extract = dir.clone();
        tokio::task::spawn_blocking(move || extract_zip(&zip_path, &dir_for_extract))
            .await
            .map_err(|e| ArenaError::Structural(format!("unzip task panicked: {e}")))?
            .map_err(|e| ArenaError::SubmissionFailed {
                submission_id,
                reason: format!("failed to unzip submission: {e}"),
            })?;
        Ok(dir)
    }

    /// Validate the unpacked tree has exactly one `Joueur.<lang>` directory
    /// with a Makefile and a run file, and return the detected language tag.
    async fn validate(&self, submission_id: i64, unpacked: &Path) -> Result<String, ArenaError> {
        let mut entries = tokio::fs::read_dir(unpacked)
            .await
            .map_err(|e| ArenaError::SubmissionFailed {
                submission_id,
                reason: format!("cannot read unpacked submission directory: {e}"),
            })?;

        let mut joueur_dirs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| ArenaError::SubmissionFailed { submission_id, reason: e.to_string() })?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if let Some(lang) = name.strip_prefix("Joueur.") {
                if entry.path().is_dir() {
                    joueur_dirs.push((name.clone(), lang.to_string(), entry.path()));
                }
            }
        }

        if joueur_dirs.len() != 1 {
            return Err(ArenaError::SubmissionFailed {
                submission_id,
                reason: format!(
                    "expected exactly one Joueur.<lang> directory, found {}",
                    joueur_dirs.len()
                ),
            });
        }

        let (_, lang, bot_dir) = joueur_dirs.into_iter().next().unwrap();
        if !KNOWN_LANGUAGES.contains(&lang.as_str()) {
            return Err(ArenaError::SubmissionFailed {
                submission_id,
                reason: format!("unrecognised language tag '{lang}'"),
            });
        }

        let has_makefile = has_case_insensitive_file(&bot_dir, "makefile").await;
        if !has_makefile {
            return Err(ArenaError::SubmissionFailed {
                submission_id,
                reason: "missing Makefile".to_string(),
            });
        }

        if !bot_dir.join("run").is_file() {
            return Err(ArenaError::SubmissionFailed {
                submission_id,
                reason: "missing run file".to_string(),
            });
        }

        Ok(lang)
    }

    async fn install_dockerfile(&self, submission_id: i64, unpacked: &Path, lang: &str) -> Result<(), ArenaError> {
        let bot_dir = unpacked.join(format!("Joueur.{lang}"));
        let library_file = self.dockerfile_root.join(lang).join("Dockerfile");
        if !library_file.is_file() {
            return Err(ArenaError::SubmissionFailed {
                submission_id,
                reason: format!("no Dockerfile library entry for language '{lang}'"),
            });
        }
        tokio::fs::copy(&library_file, bot_dir.join("Dockerfile"))
            .await
            .map_err(|e| ArenaError::Transient(crate::error::TransientError::from(e)))?;
        Ok(())
    }

    async fn build(&self, submission_id: i64, unpacked: &Path) -> Result<(), ArenaError> {
        let tag = container::image_tag(submission_id);
        let lang = detected_language(unpacked).await?;
        let bot_dir = unpacked.join(format!("Joueur.{lang}"));

        if container::image_exists(&tag).await? {
            info!(submission_id, tag, "image already cached, skipping build");
            crate::metrics::SUBMISSIONS_BUILT_TOTAL.inc();
            return Ok(());
        }

        let log_path = self.cache_root.join(format!("build_log_{submission_id}"));
        container::build_image(&tag, &bot_dir, &log_path).await?;
        let url = self
            .blob
            .upload_file(&log_path, &format!("build_log_{submission_id}"))
            .await?;

        if container::image_exists(&tag).await? {
            self.db.set_submission_status(submission_id, "finished", Some(&url)).await?;
            crate::metrics::SUBMISSIONS_BUILT_TOTAL.inc();
            Ok(())
        } else {
            self.db.set_submission_status(submission_id, "failed", Some(&url)).await?;
            crate::metrics::SUBMISSIONS_FAILED_TOTAL.inc();
            Err(ArenaError::SubmissionFailed {
                submission_id,
                reason: "image build did not produce an image".to_string(),
            })
        }
    }
}

async fn detected_language(unpacked: &Path) -> Result<String, ArenaError> {
    let mut entries = tokio::fs::read_dir(unpacked)
        .await
        .map_err(|e| ArenaError::Transient(crate::error::TransientError::from(e)))?;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| ArenaError::Transient(crate::error::TransientError::from(e)))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some(lang) = name.strip_prefix("Joueur.") {
            return Ok(lang.to_string());
        }
    }
    Err(ArenaError::Structural("re-detecting language after validation found no Joueur directory".to_string()))
}

async fn has_case_insensitive_file(dir: &Path, target_lower: &str) -> bool {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return false;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        if entry.file_name().to_string_lossy().eq_ignore_ascii_case(target_lower) {
            return true;
        }
    }
    false
}

fn extract_zip(zip_path: &Path, dest: &Path) -> Result<(), String> {
    let file = std::fs::File::open(zip_path).map_err(|e| e.to_string())?;
    let mut archive = zip::ZipArchive::new(file).map_err(|e| e.to_string())?;
    archive.extract(dest).map_err(|e| e.to_string())
}
