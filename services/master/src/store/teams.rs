use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use devlab_model::DEFAULT_TEAM;
use serde::{Deserialize, Serialize};

/// Devices a team may allocate from, per platform, plus job pinning.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeamPool {
    pub name: String,

    #[serde(default)]
    pub android: Vec<String>,

    #[serde(default)]
    pub ios: Vec<String>,

    /// Job name to the device ids reserved for that job.
    #[serde(default)]
    pub jobs: HashMap<String, Vec<String>>,
}

impl TeamPool {
    /// Device ids for the platform. `None` means both platforms.
    pub fn devices_for(&self, is_android: Option<bool>) -> HashSet<&str> {
        let lists: Vec<&Vec<String>> = match is_android {
            Some(true) => vec![&self.android],
            Some(false) => vec![&self.ios],
            None => vec![&self.android, &self.ios],
        };
        lists
            .into_iter()
            .flat_map(|ids| ids.iter().map(String::as_str))
            .collect()
    }

    /// Devices pinned to the job, if the job has any.
    pub fn pinned_for(&self, job: &str) -> Option<HashSet<&str>> {
        self.jobs
            .get(job)
            .filter(|ids| !ids.is_empty())
            .map(|ids| ids.iter().map(String::as_str).collect())
    }

    /// Devices pinned to any job of this team.
    pub fn all_pinned(&self) -> HashSet<&str> {
        self.jobs
            .values()
            .flat_map(|ids| ids.iter().map(String::as_str))
            .collect()
    }
}

/// All known team pools.
#[derive(Debug, Clone, Default)]
pub struct TeamDirectory {
    teams: Vec<TeamPool>,
}

impl TeamDirectory {
    pub fn new(teams: Vec<TeamPool>) -> Self {
        Self { teams }
    }

    /// Load a JSON array of team pools.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read teams file {}", path.display()))?;
        let teams: Vec<TeamPool> = serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse teams file {}", path.display()))?;
        Ok(Self::new(teams))
    }

    pub fn is_empty(&self) -> bool {
        self.teams.is_empty()
    }

    pub fn len(&self) -> usize {
        self.teams.len()
    }

    pub fn get(&self, name: &str) -> Option<&TeamPool> {
        self.teams.iter().find(|t| t.name.eq_ignore_ascii_case(name))
    }

    pub fn common(&self) -> Option<&TeamPool> {
        self.get(DEFAULT_TEAM)
    }

    /// The team whose job map mentions `job`.
    pub fn team_for_job(&self, job: &str) -> Option<&TeamPool> {
        self.teams.iter().find(|t| t.jobs.contains_key(job))
    }

    /// Devices reserved by teams other than `team` and the shared pool.
    pub fn reserved_by_others(&self, team: &str, is_android: Option<bool>) -> HashSet<&str> {
        self.teams
            .iter()
            .filter(|t| {
                !t.name.eq_ignore_ascii_case(team) && !t.name.eq_ignore_ascii_case(DEFAULT_TEAM)
            })
            .flat_map(|t| t.devices_for(is_android))
            .collect()
    }
}

/// Job name from a CI job link: the second-to-last path segment,
/// e.g. `https://ci.example.com/job/app-tests/123/` -> `app-tests`.
pub fn extract_job_name(job_link: &str) -> Option<&str> {
    let trimmed = job_link.trim().trim_end_matches('/');
    let mut segments = trimmed.rsplit('/');
    let _build = segments.next()?;
    segments.next().filter(|s| !s.is_empty())
}
