//! Cache policy tables: method → TTL and mutation → stale read methods.
//!
//! The TTL table is an allow-list: a method absent from it (or mapped to 0)
//! is never cached. Mutations, exports, and anything security-sensitive
//! stay off the list.

use std::time::Duration;

/// TTL for a cacheable method, or `None` when the method must never be
/// served from cache.
pub fn ttl_for(method: &str) -> Option<Duration> {
    let secs = match method {
        "get_profile" => 3600,
        "list_experience" => 1800,
        "list_skills" => 1800,
        "list_projects" => 1800,
        "list_education" => 3600,
        "list_certifications" => 3600,
        "get_resume_summary" => 900,
        _ => 0,
    };
    (secs > 0).then(|| Duration::from_secs(secs))
}

/// Read methods whose cached results a mutating method can stale.
/// Unknown methods invalidate nothing.
pub fn invalidated_by(mutation: &str) -> &'static [&'static str] {
    match mutation {
        "update_profile" => &["get_profile", "get_resume_summary"],
        "create_experience" | "update_experience" | "delete_experience" => {
            &["list_experience", "get_resume_summary"]
        }
        "create_skill" | "delete_skill" => &["list_skills", "get_resume_summary"],
        "create_project" | "update_project" | "delete_project" => {
            &["list_projects", "get_resume_summary"]
        }
        "create_education" => &["list_education", "get_resume_summary"],
        "create_certification" => &["list_certifications", "get_resume_summary"],
        _ => &[],
    }
}
