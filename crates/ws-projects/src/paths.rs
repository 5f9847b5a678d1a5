//! Key/path layout shared by both backends.
//!
//! A project's durable state lives under a single prefix:
//! `users/<uid>/projects/<pid>/` with `.meta/project.json`,
//! `.meta/enc.json` (when encryption is enabled), and file bodies under
//! `files/`.

pub const FILES_DIR: &str = "files";
pub const META_DIR: &str = ".meta";
pub const PROJECT_META_FILE: &str = ".meta/project.json";
pub const ENC_META_FILE: &str = ".meta/enc.json";

pub fn project_prefix(user_id: &str, project_id: &str) -> String {
    format!("users/{user_id}/projects/{project_id}/")
}

pub fn files_prefix(user_id: &str, project_id: &str) -> String {
    format!("{}{}/", project_prefix(user_id, project_id), FILES_DIR)
}

pub fn file_key(user_id: &str, project_id: &str, rel_path: &str) -> String {
    format!("{}{}", files_prefix(user_id, project_id), rel_path)
}

pub fn project_meta_key(user_id: &str, project_id: &str) -> String {
    format!("{}{}", project_prefix(user_id, project_id), PROJECT_META_FILE)
}

pub fn enc_meta_key(user_id: &str, project_id: &str) -> String {
    format!("{}{}", project_prefix(user_id, project_id), ENC_META_FILE)
}

/// True iff `path`, relative to `files/`, begins with one of the reserved
/// skills prefixes — the trigger for bumping `SkillsGeneration`.
pub fn touches_skills(path: &str, skills_prefixes: &[String]) -> bool {
    skills_prefixes.iter().any(|pfx| path.starts_with(pfx.as_str()))
}

/// The `README.md` every freshly created project is seeded with.
pub fn seed_readme(name: &str) -> String {
    format!("# {name}\n\nWelcome to your new project.\n")
}
