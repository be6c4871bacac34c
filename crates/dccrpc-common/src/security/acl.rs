use serde::{Deserialize, Serialize};

use crate::protocol::error::{Result, RpcError};

/// Caller IP patterns allowed to invoke a function.
///
/// Patterns are globs where `*` matches any run of characters and `?` a single
/// character, e.g. `192.168.1.*` or `10.0.?.1`. An empty list allows everyone.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessControlList {
    patterns: Vec<String>,
}

impl AccessControlList {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            patterns: patterns.into_iter().map(Into::into).collect(),
        }
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn is_allowed(&self, caller_ip: &str) -> bool {
        self.patterns.is_empty() || self.patterns.iter().any(|p| glob_match(p, caller_ip))
    }

    pub fn check(&self, function: &str, caller_ip: &str) -> Result<()> {
        if self.is_allowed(caller_ip) {
            Ok(())
        } else {
            Err(RpcError::PermissionDenied(format!(
                "Caller {} is not allowed to call '{}'",
                caller_ip, function
            )))
        }
    }
}

/// Iterative glob matcher with single-star backtracking.
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((star_pi, star_ti)) = star {
            pi = star_pi + 1;
            ti = star_ti + 1;
            star = Some((star_pi, star_ti + 1));
        } else {
            return false;
        }
    }

    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
