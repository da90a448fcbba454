//! Configuration Storage
//!
//! Tunnel definitions live one JSON file per tunnel inside the store
//! directory. Config location: ~/.xtunnel on macOS/Linux, %APPDATA%\XTunnel
//! on Windows.

use std::path::{Path, PathBuf};

use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use super::types::{AppConfig, TunnelDefinition};

/// Configuration storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Failed to determine config directory")]
    NoConfigDir,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid tunnel definition: file name is empty")]
    MissingFileName,

    #[error("Tunnel definition not found: {0}")]
    NotFound(String),
}

/// Get the XTunnel configuration directory
/// Returns %APPDATA%\XTunnel on Windows, ~/.xtunnel on macOS/Linux
pub fn config_dir() -> Result<PathBuf, StorageError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("XTunnel"));
        }
        dirs::home_dir()
            .map(|home| home.join(".xtunnel"))
            .ok_or(StorageError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".xtunnel"))
            .ok_or(StorageError::NoConfigDir)
    }
}

/// Get the log directory for storing application logs
pub fn log_dir() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("logs"))
}

/// Default directory holding tunnel definitions
pub fn tunnels_dir() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("tunnels"))
}

/// Get the application config file path
pub fn app_config_file() -> Result<PathBuf, StorageError> {
    Ok(config_dir()?.join("config.json"))
}

/// Load the application config.
/// Returns defaults if the file doesn't exist or is corrupted.
pub async fn load_app_config(path: &Path) -> Result<AppConfig, StorageError> {
    match fs::read_to_string(path).await {
        Ok(contents) => match serde_json::from_str::<AppConfig>(&contents) {
            Ok(config) => Ok(config),
            Err(e) => {
                warn!("Config file {:?} corrupted, using defaults: {}", path, e);
                Ok(AppConfig::default())
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(StorageError::Io(e)),
    }
}

/// Directory-backed store of tunnel definitions
pub struct TunnelStore {
    dir: PathBuf,
}

impl TunnelStore {
    /// Create a store at the default location
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self { dir: tunnels_dir()? })
    }

    /// Create a store with a custom directory (for testing)
    pub fn with_dir(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn ensure_dir(&self) -> Result<(), StorageError> {
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    fn path_of(&self, def: &TunnelDefinition) -> Result<PathBuf, StorageError> {
        if def.file_name.is_empty() {
            return Err(StorageError::MissingFileName);
        }
        // Only the final component is trusted, the store never writes outside its dir
        let name = Path::new(&def.file_name)
            .file_name()
            .ok_or(StorageError::MissingFileName)?;
        Ok(self.dir.join(name))
    }

    /// Load all definitions, ordered by file name.
    ///
    /// Unreadable or corrupted files are logged and skipped.
    pub async fn load(&self) -> Result<Vec<TunnelDefinition>, StorageError> {
        self.ensure_dir().await?;

        let mut entries = fs::read_dir(&self.dir).await?;
        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut definitions = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = match fs::read_to_string(&path).await {
                Ok(c) => c,
                Err(e) => {
                    error!("Failed to read tunnel definition {:?}: {}", path, e);
                    continue;
                }
            };
            match serde_json::from_str::<TunnelDefinition>(&contents) {
                Ok(mut def) => {
                    if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                        def.file_name = name.to_string();
                    }
                    definitions.push(def);
                }
                Err(e) => {
                    error!("Failed to parse tunnel definition {:?}: {}", path, e);
                }
            }
        }

        Ok(definitions)
    }

    /// Persist a new definition.
    ///
    /// Assigns a file name, an identifier and a display name when missing.
    pub async fn save(&self, def: &mut TunnelDefinition) -> Result<(), StorageError> {
        self.ensure_dir().await?;

        def.file_name = format!("{}.json", chrono::Utc::now().timestamp_micros());
        if def.identifier.is_empty() {
            def.identifier = uuid::Uuid::new_v4().to_string();
        }
        if def.config_name.is_empty() {
            def.config_name = def.display_name();
        }

        let path = self.path_of(def)?;
        self.write_atomic(&path, def).await?;
        info!("Tunnel definition saved: {:?}", path);
        Ok(())
    }

    /// Overwrite an existing definition
    pub async fn update(&self, def: &TunnelDefinition) -> Result<(), StorageError> {
        let path = self.path_of(def)?;
        if fs::metadata(&path).await.is_err() {
            return Err(StorageError::NotFound(def.file_name.clone()));
        }

        self.write_atomic(&path, def).await?;
        info!("Tunnel definition updated: {:?}", path);
        Ok(())
    }

    /// Delete a definition
    pub async fn delete(&self, def: &TunnelDefinition) -> Result<(), StorageError> {
        let path = self.path_of(def)?;
        match fs::remove_file(&path).await {
            Ok(()) => {
                info!("Tunnel definition deleted: {:?}", path);
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(def.file_name.clone()))
            }
            Err(e) => Err(StorageError::Io(e)),
        }
    }

    // Write to temp file first, then rename
    async fn write_atomic(&self, path: &Path, def: &TunnelDefinition) -> Result<(), StorageError> {
        let temp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(def)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, path).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn definition(remote_port: &str) -> TunnelDefinition {
        TunnelDefinition {
            remote_ip: "10.0.0.5".into(),
            remote_port: remote_port.into(),
            server_ip: "10.0.0.1".into(),
            server_port: "22".into(),
            user_name: "deploy".into(),
            password: "secret".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_load_empty_dir() {
        let temp = tempdir().unwrap();
        let store = TunnelStore::with_dir(temp.path().join("tunnels"));

        let defs = store.load().await.unwrap();
        assert!(defs.is_empty());
        assert!(store.dir().exists());
    }

    #[tokio::test]
    async fn test_save_assigns_identity() {
        let temp = tempdir().unwrap();
        let store = TunnelStore::with_dir(temp.path().to_path_buf());

        let mut def = definition("5432");
        store.save(&mut def).await.unwrap();

        assert!(def.file_name.ends_with(".json"));
        assert!(!def.identifier.is_empty());
        assert_eq!(def.config_name, "10.0.0.5:5432");

        let loaded = store.load().await.unwrap();
        assert_eq!(loaded, vec![def]);
    }

    #[tokio::test]
    async fn test_load_is_ordered_and_skips_corrupt_files() {
        let temp = tempdir().unwrap();
        let store = TunnelStore::with_dir(temp.path().to_path_buf());

        let mut first = definition("5432");
        store.save(&mut first).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let mut second = definition("6379");
        store.save(&mut second).await.unwrap();

        std::fs::write(temp.path().join("0.json"), "{ not json").unwrap();
        std::fs::write(temp.path().join("notes.txt"), "ignored").unwrap();

        let loaded = store.load().await.unwrap();
        let ports: Vec<_> = loaded.iter().map(|d| d.remote_port.as_str()).collect();
        assert_eq!(ports, vec!["5432", "6379"]);
    }

    #[tokio::test]
    async fn test_update_and_delete() {
        let temp = tempdir().unwrap();
        let store = TunnelStore::with_dir(temp.path().to_path_buf());

        let mut def = definition("5432");
        store.save(&mut def).await.unwrap();

        def.config_name = "Postgres".into();
        store.update(&def).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert_eq!(loaded[0].config_name, "Postgres");

        store.delete(&def).await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
        assert!(matches!(
            store.delete(&def).await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            store.update(&def).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_file_name_rejected() {
        let temp = tempdir().unwrap();
        let store = TunnelStore::with_dir(temp.path().to_path_buf());

        let def = definition("5432");
        assert!(matches!(
            store.update(&def).await,
            Err(StorageError::MissingFileName)
        ));
    }

    #[tokio::test]
    async fn test_app_config_defaults_when_missing_or_corrupt() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.json");

        let config = load_app_config(&path).await.unwrap();
        assert_eq!(config.settings.max_connections, 20);

        std::fs::write(&path, r#"{"settings":{"max_connections":4}}"#).unwrap();
        let config = load_app_config(&path).await.unwrap();
        assert_eq!(config.settings.max_connections, 4);
        assert_eq!(config.settings.connect_attempts, 3);

        std::fs::write(&path, "garbage").unwrap();
        let config = load_app_config(&path).await.unwrap();
        assert_eq!(config.settings.max_connections, 20);
    }
}
