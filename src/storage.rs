use crate::errors::AppError;
use crate::models::{
    AppData, GroupsDocument, MembersDocument, ReminderSettingsDocument, RemindersDocument,
};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, error};

/// Locations of the JSON documents that make up the persisted state.
#[derive(Debug, Clone)]
pub struct DataFiles {
    pub dir: PathBuf,
    pub groups: PathBuf,
    pub members: PathBuf,
    pub reminders: PathBuf,
    pub settings: PathBuf,
}

impl DataFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            groups: dir.join("groups.json"),
            members: dir.join("members.json"),
            reminders: dir.join("reminders.json"),
            settings: dir.join("reminder-settings.json"),
            dir,
        }
    }
}

pub async fn ensure_data_dir(files: &DataFiles) -> Result<(), AppError> {
    fs::create_dir_all(&files.dir).await?;
    Ok(())
}

pub async fn load_data(files: &DataFiles) -> Result<AppData, AppError> {
    Ok(AppData {
        groups: load_document(&files.groups).await?,
        members: load_document(&files.members).await?,
        reminders: load_document(&files.reminders).await?,
        settings: load_document(&files.settings).await?,
    })
}

pub async fn persist_groups(files: &DataFiles, doc: &GroupsDocument) -> Result<(), AppError> {
    persist_document(&files.groups, doc).await
}

pub async fn persist_members(files: &DataFiles, doc: &MembersDocument) -> Result<(), AppError> {
    persist_document(&files.members, doc).await
}

pub async fn persist_reminders(
    files: &DataFiles,
    doc: &RemindersDocument,
) -> Result<(), AppError> {
    persist_document(&files.reminders, doc).await
}

pub async fn persist_settings(
    files: &DataFiles,
    doc: &ReminderSettingsDocument,
) -> Result<(), AppError> {
    persist_document(&files.settings, doc).await
}

/// A missing file is an empty document; an unreadable or corrupt one is an error.
async fn load_document<T>(path: &Path) -> Result<T, AppError>
where
    T: DeserializeOwned + Default,
{
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes).map_err(|err| {
            error!("failed to parse {}: {err}", path.display());
            AppError::storage(format!("{}: {err}", path.display()))
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            debug!("{} not found, starting empty", path.display());
            Ok(T::default())
        }
        Err(err) => {
            error!("failed to read {}: {err}", path.display());
            Err(AppError::storage(format!("{}: {err}", path.display())))
        }
    }
}

async fn persist_document<T: Serialize>(path: &Path, doc: &T) -> Result<(), AppError> {
    let payload = serde_json::to_vec_pretty(doc)?;
    let staging = path.with_extension("json.tmp");
    fs::write(&staging, payload).await?;
    fs::rename(&staging, path).await?;
    Ok(())
}
