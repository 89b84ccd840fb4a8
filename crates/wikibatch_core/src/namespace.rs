use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use crate::config::CustomNamespace;

pub const NS_MAIN: i32 = 0;
pub const NS_TALK: i32 = 1;
pub const NS_USER: i32 = 2;
pub const NS_USER_TALK: i32 = 3;
pub const NS_PROJECT: i32 = 4;
pub const NS_FILE: i32 = 6;
pub const NS_FILE_TALK: i32 = 7;
pub const NS_MEDIAWIKI: i32 = 8;
pub const NS_TEMPLATE: i32 = 10;
pub const NS_HELP: i32 = 12;
pub const NS_CATEGORY: i32 = 14;
pub const NS_MODULE: i32 = 828;

/// A normalized page title with its resolved namespace id. Two titles with
/// equal normalized text are equal; the namespace is derived from the text.
#[derive(Debug, Clone, Serialize, PartialEq, Eq, Hash)]
pub struct Title {
    text: String,
    namespace: i32,
}

impl Title {
    fn new(text: String, namespace: i32) -> Self {
        Self { text, namespace }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn namespace(&self) -> i32 {
        self.namespace
    }
}

impl fmt::Display for Title {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

pub struct NamespaceResolver {
    ids_by_name: BTreeMap<String, i32>,
    canonical_names: BTreeMap<i32, String>,
}

impl Default for NamespaceResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceResolver {
    pub fn new() -> Self {
        let mut resolver = Self {
            ids_by_name: BTreeMap::new(),
            canonical_names: BTreeMap::new(),
        };
        for (name, id) in BUILTIN_NAMESPACES {
            resolver.register(name, *id);
        }
        for (alias, id) in BUILTIN_ALIASES {
            resolver.register_alias(alias, *id);
        }
        resolver
    }

    pub fn with_custom_namespaces(custom: &[CustomNamespace]) -> Self {
        let mut resolver = Self::new();
        for namespace in custom {
            resolver.register(&namespace.name, namespace.id);
        }
        resolver
    }

    fn register(&mut self, name: &str, id: i32) {
        self.ids_by_name.insert(name.to_ascii_lowercase(), id);
        self.canonical_names
            .entry(id)
            .or_insert_with(|| name.to_string());
    }

    fn register_alias(&mut self, name: &str, id: i32) {
        self.ids_by_name.insert(name.to_ascii_lowercase(), id);
    }

    /// Infer the namespace from a recognized prefix, defaulting to Main.
    pub fn resolve(&self, raw: &str) -> Title {
        let normalized = normalize_title(raw);
        if let Some((prefix, rest)) = normalized.split_once(':') {
            let rest = rest.trim();
            if !rest.is_empty()
                && let Some(&id) = self.ids_by_name.get(&prefix.trim().to_ascii_lowercase())
            {
                let canonical = self
                    .canonical_names
                    .get(&id)
                    .map(String::as_str)
                    .unwrap_or_else(|| prefix.trim());
                return Title::new(format!("{canonical}:{rest}"), id);
            }
        }
        Title::new(normalized, NS_MAIN)
    }

    pub fn which(&self, raw: &str) -> i32 {
        self.resolve(raw).namespace()
    }

    /// Ensure a title sits in the requested namespace, adding the canonical
    /// prefix when it is missing and stripping it when coercing to Main.
    pub fn coerce_into(&self, raw: &str, namespace: i32) -> Title {
        let resolved = self.resolve(raw);
        if resolved.namespace() == namespace {
            return resolved;
        }
        let bare = match resolved.text().split_once(':') {
            Some((_, rest)) if resolved.namespace() != NS_MAIN => rest.trim().to_string(),
            _ => resolved.text().to_string(),
        };
        if namespace == NS_MAIN {
            return Title::new(bare, NS_MAIN);
        }
        match self.canonical_names.get(&namespace) {
            Some(name) => Title::new(format!("{name}:{bare}"), namespace),
            None => resolved,
        }
    }
}

const BUILTIN_NAMESPACES: &[(&str, i32)] = &[
    ("Talk", NS_TALK),
    ("User", NS_USER),
    ("User talk", NS_USER_TALK),
    ("Project", NS_PROJECT),
    ("Project talk", 5),
    ("File", NS_FILE),
    ("File talk", NS_FILE_TALK),
    ("MediaWiki", NS_MEDIAWIKI),
    ("MediaWiki talk", 9),
    ("Template", NS_TEMPLATE),
    ("Template talk", 11),
    ("Help", NS_HELP),
    ("Help talk", 13),
    ("Category", NS_CATEGORY),
    ("Category talk", 15),
    ("Module", NS_MODULE),
];

const BUILTIN_ALIASES: &[(&str, i32)] = &[("Image", NS_FILE), ("Image talk", NS_FILE_TALK)];

fn normalize_title(raw: &str) -> String {
    raw.replace('_', " ").trim().to_string()
}
