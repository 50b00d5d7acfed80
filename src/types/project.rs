//! Project configuration

use serde::{Deserialize, Serialize};

/// Identifier of a project (database row id)
pub type ProjectId = i64;

/// One named pipeline phase, executed in declared order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phase {
    /// Step name shown in logs (e.g. "compile", "test")
    pub name: String,
    /// Shell command line run inside the build container
    pub command: String,
}

/// Per-repository build configuration owned by a user
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,

    /// Full repository name, e.g. "acme/widget"
    pub repository: String,

    pub default_branch: String,

    /// Glob-like filter applied to push branches; empty means all branches
    #[serde(default)]
    pub branch_filter: Option<String>,

    /// Whether pull-request events produce builds
    #[serde(default)]
    pub build_pull_requests: bool,

    /// Hard ceiling for one build, in seconds
    pub max_duration_secs: u64,

    /// Container image override; falls back to the configured default
    #[serde(default)]
    pub image: Option<String>,

    /// Optional build profile exposed to phases as BUILD_PROFILE
    #[serde(default)]
    pub profile: Option<String>,

    /// Secret names that must exist in the vault before dispatch
    #[serde(default)]
    pub required_secrets: Vec<String>,

    /// Pipeline phases in execution order
    pub phases: Vec<Phase>,

    /// Whether the build gets the host engine socket (Docker-in-Docker)
    #[serde(default)]
    pub allow_host_engine: bool,

    /// Send an email when a build fails
    #[serde(default)]
    pub notify_on_failure: bool,

    pub owner_id: i64,
}

impl Project {
    /// Check a push branch against the project's filter.
    ///
    /// The filter is a glob-like expression where `*` matches any run of
    /// characters. An absent or empty filter accepts every branch.
    pub fn branch_matches(&self, branch: &str) -> bool {
        match self.branch_filter.as_deref() {
            None | Some("") => true,
            Some(filter) => glob_match(filter, branch),
        }
    }
}

fn glob_match(pattern: &str, input: &str) -> bool {
    // Translate the `*` wildcard into an anchored regex; everything else
    // is matched literally.
    let mut re = String::with_capacity(pattern.len() + 8);
    re.push('^');
    for ch in pattern.chars() {
        if ch == '*' {
            re.push_str(".*");
        } else {
            re.push_str(&regex::escape(&ch.to_string()));
        }
    }
    re.push('$');

    regex::Regex::new(&re)
        .map(|r| r.is_match(input))
        .unwrap_or(false)
}
