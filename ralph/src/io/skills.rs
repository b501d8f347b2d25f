//! Skill snippets injected into the prompt (`.ralph/skills/<name>.md`).

use anyhow::Result;
use serde::Serialize;
use tracing::warn;

use crate::io::files::read_optional;
use crate::io::init::RalphPaths;

/// A loaded skill file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skill {
    pub name: String,
    pub content: String,
}

/// Load each named skill in order. Missing skills and names that are not
/// plain file names are skipped with a warning.
pub fn load_skills(paths: &RalphPaths, names: &[String]) -> Result<Vec<Skill>> {
    let mut skills = Vec::new();
    for name in names {
        let Some(path) = paths.skill_path(name) else {
            warn!(skill = %name, "skill name is not a plain file name, skipping");
            continue;
        };
        match read_optional(&path)? {
            Some(content) if !content.trim().is_empty() => skills.push(Skill {
                name: name.clone(),
                content: content.trim().to_string(),
            }),
            Some(_) => warn!(skill = %name, "skill file is empty"),
            None => warn!(skill = %name, path = %path.display(), "skill not found"),
        }
    }
    Ok(skills)
}
