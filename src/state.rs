use crate::auth::{FileUserStore, SessionKeys, UserStore};
use crate::config::Config;
use crate::errors::AppError;
use crate::models::AppData;
use crate::reminders::{build_gateway, MessageGateway};
use crate::storage::{ensure_data_dir, load_data, DataFiles};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

/// Shared by every handler and the background job.
///
/// All documents live behind one lock: a writer stages copies of what it
/// touches, persists them, and only then swaps them in, so concurrent
/// requests cannot overwrite each other's changes.
#[derive(Clone)]
pub struct AppState {
    pub files: Arc<DataFiles>,
    pub data: Arc<Mutex<AppData>>,
    pub gateway: Arc<dyn MessageGateway>,
    pub users: Arc<dyn UserStore>,
    pub sessions: Arc<SessionKeys>,
}

impl AppState {
    pub fn new(
        files: DataFiles,
        data: AppData,
        gateway: Arc<dyn MessageGateway>,
        users: Arc<dyn UserStore>,
        sessions: SessionKeys,
    ) -> Self {
        Self {
            files: Arc::new(files),
            data: Arc::new(Mutex::new(data)),
            gateway,
            users,
            sessions: Arc::new(sessions),
        }
    }

    pub async fn initialize(config: &Config) -> Result<Self, AppError> {
        let files = DataFiles::new(&config.data_dir);
        ensure_data_dir(&files).await?;
        let data = load_data(&files).await?;
        info!(
            groups = data.groups.groups.len(),
            logs = data.reminders.logs.len(),
            "loaded data from {}",
            files.dir.display()
        );

        let users = FileUserStore::load(&config.users_path).await?;
        let sessions = SessionKeys::new(&config.jwt_secret, config.session_ttl);

        Ok(Self::new(
            files,
            data,
            build_gateway(config.gateway),
            Arc::new(users),
            sessions,
        ))
    }
}
