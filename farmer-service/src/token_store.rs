// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::path::PathBuf;

use anyhow::Context;
use async_trait::async_trait;

/// Persists the single session token per account.
#[async_trait]
pub trait TokenStore: Send + Sync {
    async fn load(&self, account_id: &str) -> anyhow::Result<Option<String>>;
    async fn save(&self, account_id: &str, token: &str) -> anyhow::Result<()>;
    async fn remove(&self, account_id: &str) -> anyhow::Result<()>;
}

/// Stores tokens as `{dir}/{account_id}.token`.
#[derive(Debug, Clone)]
pub struct FileTokenStore {
    dir: PathBuf,
}

impl FileTokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn path_for(&self, account_id: &str) -> PathBuf {
        let safe: String = account_id
            .chars()
            .filter(|ch| ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_'))
            .collect();
        self.dir.join(format!("{safe}.token"))
    }
}

#[async_trait]
impl TokenStore for FileTokenStore {
    async fn load(&self, account_id: &str) -> anyhow::Result<Option<String>> {
        let path = self.path_for(account_id);
        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => {
                let token = raw.trim().to_string();
                Ok((!token.is_empty()).then_some(token))
            }
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => {
                Err(error).with_context(|| format!("failed to read token file {}", path.display()))
            }
        }
    }

    async fn save(&self, account_id: &str, token: &str) -> anyhow::Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create token dir {}", self.dir.display()))?;
        let path = self.path_for(account_id);
        tokio::fs::write(&path, token)
            .await
            .with_context(|| format!("failed to write token file {}", path.display()))
    }

    async fn remove(&self, account_id: &str) -> anyhow::Result<()> {
        let path = self.path_for(account_id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => {
                Err(error).with_context(|| format!("failed to remove token file {}", path.display()))
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryTokenStore {
        pub tokens: Mutex<HashMap<String, String>>,
    }

    #[async_trait]
    impl TokenStore for MemoryTokenStore {
        async fn load(&self, account_id: &str) -> anyhow::Result<Option<String>> {
            Ok(self.tokens.lock().unwrap().get(account_id).cloned())
        }

        async fn save(&self, account_id: &str, token: &str) -> anyhow::Result<()> {
            self.tokens
                .lock()
                .unwrap()
                .insert(account_id.to_string(), token.to_string());
            Ok(())
        }

        async fn remove(&self, account_id: &str) -> anyhow::Result<()> {
            self.tokens.lock().unwrap().remove(account_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_store_round_trip_and_removal() {
        let dir = std::env::temp_dir().join(format!("farmer-token-{}", uuid::Uuid::new_v4()));
        let store = FileTokenStore::new(&dir);

        assert_eq!(store.load("acct").await.unwrap(), None);
        store.save("acct", "jwt.token.value").await.unwrap();
        assert_eq!(
            store.load("acct").await.unwrap().as_deref(),
            Some("jwt.token.value")
        );
        store.remove("acct").await.unwrap();
        store.remove("acct").await.unwrap();
        assert_eq!(store.load("acct").await.unwrap(), None);

        let _ = std::fs::remove_dir_all(dir);
    }

    #[test]
    fn account_ids_cannot_escape_the_directory() {
        let store = FileTokenStore::new("/tmp/tokens");
        assert_eq!(
            store.path_for("../etc/passwd"),
            PathBuf::from("/tmp/tokens/etcpasswd.token")
        );
    }
}
