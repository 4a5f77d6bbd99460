//! Challenge lookup, supplied by the embedding application

use anyhow::{Context, Result};
use async_trait::async_trait;
use codelab_common::Challenge;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

#[async_trait]
pub trait ChallengeRepository: Send + Sync {
    /// `Ok(None)` when no challenge has this id
    async fn get_challenge(&self, id: &str) -> Result<Option<Challenge>>;
}

#[derive(Debug, Deserialize)]
struct ChallengesJson {
    challenges: Vec<Challenge>,
}

/// Challenges held in memory, optionally loaded from a JSON file
#[derive(Debug, Default)]
pub struct InMemoryChallengeRepository {
    challenges: RwLock<HashMap<String, Challenge>>,
}

impl InMemoryChallengeRepository {
    pub fn new(challenges: impl IntoIterator<Item = Challenge>) -> Self {
        Self {
            challenges: RwLock::new(challenges.into_iter().map(|c| (c.id.clone(), c)).collect()),
        }
    }

    /// Load `{"challenges": [...]}` from `path`
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read challenges from {}", path.display()))?;
        let parsed: ChallengesJson = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse challenges from {}", path.display()))?;
        Ok(Self::new(parsed.challenges))
    }

    pub fn insert(&self, challenge: Challenge) {
        let mut challenges = self.challenges.write().unwrap_or_else(|e| e.into_inner());
        challenges.insert(challenge.id.clone(), challenge);
    }

    pub fn len(&self) -> usize {
        self.challenges.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ChallengeRepository for InMemoryChallengeRepository {
    async fn get_challenge(&self, id: &str) -> Result<Option<Challenge>> {
        let challenges = self.challenges.read().unwrap_or_else(|e| e.into_inner());
        Ok(challenges.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::challenge_with;
    use std::io::Write;

    #[tokio::test]
    async fn test_lookup() {
        let repo = InMemoryChallengeRepository::new([challenge_with(&[("1", "1")])]);
        assert!(repo.get_challenge("echo").await.unwrap().is_some());
        assert!(repo.get_challenge("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"challenges": [{{"id": "sum", "title": "Sum", "testCases": [{{"id": 1, "input": "1 2", "expectedOutput": "3"}}]}}]}}"#
        )
        .unwrap();

        let repo = InMemoryChallengeRepository::from_json_file(file.path()).unwrap();
        assert_eq!(repo.len(), 1);
        let challenge = repo.get_challenge("sum").await.unwrap().unwrap();
        assert_eq!(challenge.test_cases[0].expected_output, "3");
    }

    #[test]
    fn test_bad_file_is_an_error() {
        assert!(InMemoryChallengeRepository::from_json_file(Path::new("/nonexistent.json")).is_err());
    }
}
