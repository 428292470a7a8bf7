//! Per-file manifest summary extraction (§4.4 "Manifest extraction").

use crate::util::truncate_with_ellipsis;

pub const MANIFEST_CAP: usize = 512;

const KNOWN_MANIFESTS: &[&str] = &[
    "package.json",
    "Makefile",
    "justfile",
    "Cargo.toml",
    "pyproject.toml",
    "go.mod",
    "CMakeLists.txt",
];

pub fn known_manifest_names() -> &'static [&'static str] {
    KNOWN_MANIFESTS
}

/// Returns `(label, summary)` for a manifest file's raw content, or `None`
/// when nothing worth summarizing was found.
pub fn summarize(file_name: &str, content: &str) -> Option<(String, String)> {
    let capped: String = content.chars().take(MANIFEST_CAP).collect();
    let (label, summary) = match file_name {
        "package.json" => ("package.json scripts".to_string(), summarize_package_json(&capped)?),
        "Makefile" => ("Makefile targets".to_string(), summarize_makefile(&capped)?),
        "justfile" => ("justfile recipes".to_string(), summarize_justfile(&capped)?),
        "Cargo.toml" => (file_name.to_string(), summarize_cargo_toml(&capped)?),
        "go.mod" => (file_name.to_string(), summarize_go_mod(&capped)?),
        "pyproject.toml" => (file_name.to_string(), summarize_pyproject(&capped)?),
        "CMakeLists.txt" => (file_name.to_string(), summarize_cmake(&capped)?),
        _ => return None,
    };
    Some((label, truncate_with_ellipsis(&summary, MANIFEST_CAP)))
}

fn summarize_package_json(content: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(content).ok()?;
    let scripts = value.get("scripts")?.as_object()?;
    if scripts.is_empty() {
        return None;
    }
    let pairs: Vec<String> = scripts
        .iter()
        .filter_map(|(key, val)| val.as_str().map(|v| format!("{key}: {v}")))
        .collect();
    if pairs.is_empty() {
        None
    } else {
        Some(pairs.join(", "))
    }
}

fn summarize_makefile(content: &str) -> Option<String> {
    let mut targets = Vec::new();
    for line in content.lines() {
        if line.starts_with('\t') || line.starts_with(' ') || line.trim().is_empty() {
            continue;
        }
        let trimmed = line.trim();
        if trimmed.starts_with('#') || trimmed.starts_with('.') {
            continue;
        }
        if trimmed.contains(":=") {
            continue;
        }
        let Some(colon) = trimmed.find(':') else {
            continue;
        };
        let name = trimmed[..colon].trim();
        if name.is_empty() || name.contains('$') || name.contains('%') {
            continue;
        }
        targets.push(name.to_string());
    }
    if targets.is_empty() {
        None
    } else {
        Some(targets.join(", "))
    }
}

fn summarize_justfile(content: &str) -> Option<String> {
    let mut recipes = Vec::new();
    for line in content.lines() {
        if line.starts_with(' ') || line.starts_with('\t') || line.trim().is_empty() {
            continue;
        }
        let trimmed = line.trim();
        if trimmed.starts_with('#') || trimmed.contains(":=") {
            continue;
        }
        let Some(colon) = trimmed.find(':') else {
            continue;
        };
        let name = trimmed[..colon].trim();
        if name.is_empty() {
            continue;
        }
        recipes.push(name.to_string());
    }
    if recipes.is_empty() {
        None
    } else {
        Some(recipes.join(", "))
    }
}

fn summarize_cargo_toml(content: &str) -> Option<String> {
    let value: toml::Value = toml::from_str(content).ok()?;
    let mut names = Vec::new();
    if let Some(name) = value.get("package").and_then(|p| p.get("name")).and_then(|n| n.as_str()) {
        names.push(format!("name = \"{name}\""));
    }
    if let Some(bins) = value.get("bin").and_then(|b| b.as_array()) {
        for bin in bins {
            if let Some(name) = bin.get("name").and_then(|n| n.as_str()) {
                names.push(format!("name = \"{name}\""));
            }
        }
    }
    if names.is_empty() {
        None
    } else {
        Some(names.join(", "))
    }
}

fn summarize_go_mod(content: &str) -> Option<String> {
    let mut module_line = None;
    let mut go_line = None;
    for line in content.lines() {
        let trimmed = line.trim();
        if module_line.is_none() && trimmed.starts_with("module ") {
            module_line = Some(trimmed.to_string());
        }
        if go_line.is_none() && trimmed.starts_with("go ") && !trimmed.starts_with("go.") {
            go_line = Some(trimmed.to_string());
        }
    }
    let parts: Vec<String> = [module_line, go_line].into_iter().flatten().collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join(", "))
    }
}

fn summarize_pyproject(content: &str) -> Option<String> {
    let value: toml::Value = toml::from_str(content).ok()?;
    let name = value.get("project").and_then(|p| p.get("name")).and_then(|n| n.as_str())?;
    Some(format!("name = \"{name}\""))
}

fn summarize_cmake(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find(|line| line.starts_with("project("))
        .map(str::to_string)
}
