//! Inventory loading and target-set resolution
//!
//! The inventory file declares targets, nested groups, aliases and the option
//! layers each target inherits. Target-set expressions given on the command
//! line or in plan steps resolve against it into a flat, de-duplicated list.
//!
//! # Example
//!
//! ```yaml
//! config:
//!   ssh:
//!     user: deploy
//! groups:
//!   - name: web
//!     targets:
//!       - web1.example.com
//!       - uri: ssh://web2.example.com:2222
//!         alias: w2
//!     features: [agent]
//! ```

use crate::config::ProjectConfig;
use crate::error::{Result, TetherError};
use crate::target::{Target, TransportConfig, TransportKind};
use crate::transports::validate_options;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::Read;
use std::path::Path;
use std::sync::RwLock;
use tracing::{debug, warn};

/// Resolves target-set expressions and owns the fact store
pub trait TargetResolver: Send + Sync {
    /// Flat, de-duplicated target list for an expression
    fn resolve(&self, expression: &str) -> Result<Vec<Target>>;

    /// Merge facts into a target's fact store
    fn add_facts(&self, target: &str, facts: &Map<String, Value>) -> Result<()>;
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(untagged)]
enum OneOrMany {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::None => Vec::new(),
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TargetEntry {
    Uri(String),
    Detailed {
        #[serde(default)]
        uri: Option<String>,
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        alias: OneOrMany,
        #[serde(flatten)]
        layer: Layer,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
struct Layer {
    #[serde(default)]
    config: Map<String, Value>,
    #[serde(default)]
    facts: Map<String, Value>,
    #[serde(default)]
    features: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct GroupEntry {
    name: String,
    #[serde(default)]
    targets: Vec<TargetEntry>,
    #[serde(default)]
    groups: Vec<GroupEntry>,
    #[serde(default)]
    config: Map<String, Value>,
    #[serde(default)]
    facts: Map<String, Value>,
    #[serde(default)]
    features: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct InventoryFile {
    #[serde(default)]
    config: Map<String, Value>,
    #[serde(default)]
    facts: Map<String, Value>,
    #[serde(default)]
    features: Vec<String>,
    #[serde(default)]
    targets: Vec<TargetEntry>,
    #[serde(default)]
    groups: Vec<GroupEntry>,
}

/// A target as declared, with the ids of every layer that applies to it
struct Declared {
    name: String,
    uri: String,
    layers: Vec<usize>,
}

/// Layers and memberships collected while walking the group tree
#[derive(Default)]
struct Collector {
    layers: Vec<Layer>,
    declared: Vec<Declared>,
    index: HashMap<String, usize>,
    groups: BTreeMap<String, Vec<String>>,
    aliases: HashMap<String, String>,
}

impl Collector {
    fn add_layer(&mut self, layer: Layer) -> usize {
        self.layers.push(layer);
        self.layers.len() - 1
    }

    fn declare(&mut self, entry: TargetEntry, chain: &[usize]) -> Result<String> {
        let (name, uri, aliases, own) = match entry {
            TargetEntry::Uri(uri) => (uri.clone(), uri, Vec::new(), None),
            TargetEntry::Detailed {
                uri,
                name,
                alias,
                layer,
            } => {
                let (name, uri) = match (name, uri) {
                    (Some(name), Some(uri)) => (name, uri),
                    (Some(name), None) => (name.clone(), name),
                    (None, Some(uri)) => (uri.clone(), uri),
                    (None, None) => {
                        return Err(TetherError::Inventory(
                            "target entry needs a 'uri' or a 'name'".to_string(),
                        ))
                    }
                };
                (name, uri, alias.into_vec(), Some(layer))
            }
        };

        let mut layers: Vec<usize> = chain.to_vec();
        if let Some(layer) = own {
            layers.push(self.add_layer(layer));
        }

        match self.index.get(&name) {
            Some(&i) => {
                let existing = &mut self.declared[i];
                if existing.uri != uri {
                    return Err(TetherError::Inventory(format!(
                        "target '{}' is declared with two URIs: {} and {}",
                        name, existing.uri, uri
                    )));
                }
                for id in layers {
                    if !existing.layers.contains(&id) {
                        existing.layers.push(id);
                    }
                }
            }
            None => {
                self.index.insert(name.clone(), self.declared.len());
                self.declared.push(Declared {
                    name: name.clone(),
                    uri,
                    layers,
                });
            }
        }

        for alias in aliases {
            if let Some(previous) = self.aliases.insert(alias.clone(), name.clone()) {
                if previous != name {
                    return Err(TetherError::Inventory(format!(
                        "alias '{}' refers to both {} and {}",
                        alias, previous, name
                    )));
                }
            }
        }
        Ok(name)
    }

    fn walk(&mut self, group: GroupEntry, chain: &[usize]) -> Result<Vec<String>> {
        if group.name == "all" {
            return Err(TetherError::Inventory(
                "'all' is reserved and cannot name a group".to_string(),
            ));
        }
        if !is_valid_group_name(&group.name) {
            return Err(TetherError::Inventory(format!(
                "invalid group name '{}'",
                group.name
            )));
        }
        if self.groups.contains_key(&group.name) {
            return Err(TetherError::Inventory(format!(
                "group '{}' is declared twice",
                group.name
            )));
        }
        // Reserve the name before descending so a child cannot reuse it
        self.groups.insert(group.name.clone(), Vec::new());

        let id = self.add_layer(Layer {
            config: group.config,
            facts: group.facts,
            features: group.features,
        });
        let mut chain = chain.to_vec();
        chain.push(id);

        let mut members = Vec::new();
        for entry in group.targets {
            members.push(self.declare(entry, &chain)?);
        }
        for child in group.groups {
            members.extend(self.walk(child, &chain)?);
        }
        dedup_in_order(&mut members);
        self.groups.insert(group.name, members.clone());
        Ok(members)
    }
}

fn is_valid_group_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn dedup_in_order(names: &mut Vec<String>) {
    let mut seen = HashSet::new();
    names.retain(|n| seen.insert(n.clone()));
}

/// Loaded inventory plus the mutable fact store
pub struct Inventory {
    targets: Vec<Target>,
    by_name: HashMap<String, usize>,
    groups: BTreeMap<String, Vec<String>>,
    aliases: HashMap<String, String>,
    top: Layer,
    project: ProjectConfig,
    facts: RwLock<HashMap<String, Map<String, Value>>>,
}

impl Inventory {
    /// Inventory with no declared targets; literal URIs still resolve
    pub fn empty(project: ProjectConfig) -> Self {
        Self {
            targets: Vec::new(),
            by_name: HashMap::new(),
            groups: BTreeMap::new(),
            aliases: HashMap::new(),
            top: Layer::default(),
            project,
            facts: RwLock::new(HashMap::new()),
        }
    }

    /// Load an inventory file; a missing file is an empty inventory
    pub fn load(path: &Path, project: ProjectConfig) -> Result<Self> {
        if !path.exists() {
            debug!("No inventory at {}, using an empty one", path.display());
            return Ok(Self::empty(project));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content, project)
    }

    pub fn from_yaml(content: &str, project: ProjectConfig) -> Result<Self> {
        let file: InventoryFile = if content.trim().is_empty() {
            InventoryFile::default()
        } else {
            serde_yaml::from_str(content)
                .map_err(|e| TetherError::Inventory(format!("malformed inventory: {}", e)))?
        };

        let mut collector = Collector::default();
        let top = Layer {
            config: file.config,
            facts: file.facts,
            features: file.features,
        };
        let top_id = collector.add_layer(top.clone());
        for entry in file.targets {
            collector.declare(entry, &[top_id])?;
        }
        for group in file.groups {
            collector.walk(group, &[top_id])?;
        }

        let mut inventory = Self::empty(project);
        inventory.top = top;
        for declared in &collector.declared {
            let layers: Vec<&Layer> = declared
                .layers
                .iter()
                .map(|&id| &collector.layers[id])
                .collect();
            let mut target = inventory.build_target(&declared.uri, &layers)?;
            target.name = declared.name.clone();
            inventory
                .by_name
                .insert(target.name.clone(), inventory.targets.len());
            inventory.targets.push(target);
        }

        for alias in collector.aliases.keys() {
            if inventory.by_name.contains_key(alias) || collector.groups.contains_key(alias) {
                return Err(TetherError::Inventory(format!(
                    "alias '{}' collides with a target or group name",
                    alias
                )));
            }
        }
        inventory.groups = collector.groups;
        inventory.aliases = collector.aliases;
        Ok(inventory)
    }

    /// Resolve transport and options for one URI through a layer chain
    ///
    /// Precedence, lowest first: project transport defaults, each layer in
    /// order (inventory top level, outer to inner groups, the target's own),
    /// then values carried in the URI itself.
    fn build_target(&self, uri: &str, layers: &[&Layer]) -> Result<Target> {
        let mut default_transport = self.project.transport;
        for layer in layers {
            if let Some(kind) = layer.config.get("transport").and_then(Value::as_str) {
                default_transport = TransportKind::from_scheme(kind)?;
            }
        }

        let mut target = Target::parse(uri, default_transport)?;
        let kind = target.transport;
        let mut config: TransportConfig = self.project.transport_options(kind);
        for layer in layers {
            if let Some(Value::Object(options)) = layer.config.get(kind.as_str()) {
                config.merge(&TransportConfig::from_map(options.clone()));
            }
        }
        config.merge(&target.config);
        validate_options(kind, &config).map_err(|e| {
            TetherError::Inventory(format!("target '{}': {}", uri, e))
        })?;
        target.config = config;

        for layer in layers {
            for (key, value) in &layer.facts {
                target.facts.insert(key.clone(), value.clone());
            }
            target.features.extend(layer.features.iter().cloned());
        }
        Ok(target)
    }

    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    pub fn group_names(&self) -> Vec<&str> {
        self.groups.keys().map(String::as_str).collect()
    }

    /// Known target by name or alias, with stored facts applied
    pub fn get(&self, name: &str) -> Option<Target> {
        let name = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        self.by_name
            .get(name)
            .map(|&i| self.with_facts(self.targets[i].clone()))
    }

    fn with_facts(&self, mut target: Target) -> Target {
        let store = self.facts.read().unwrap_or_else(|e| e.into_inner());
        if let Some(facts) = store.get(&target.name) {
            for (key, value) in facts {
                target.facts.insert(key.clone(), value.clone());
            }
        }
        target
    }

    /// Resolve with an explicit reader standing in for `-`
    pub fn resolve_from(&self, expression: &str, stdin: &mut dyn Read) -> Result<Vec<Target>> {
        let mut names = Vec::new();
        let mut resolved: Vec<Target> = Vec::new();
        let mut stdin_used = false;

        let mut parts: Vec<String> = split_expression(expression);
        let mut i = 0;
        while i < parts.len() {
            let part = parts[i].clone();
            i += 1;

            if part == "-" {
                if stdin_used {
                    continue;
                }
                stdin_used = true;
                let mut input = String::new();
                stdin.read_to_string(&mut input)?;
                let extra: Vec<String> = input.split_whitespace().map(str::to_string).collect();
                parts.splice(i..i, extra);
                continue;
            }
            if let Some(file) = part.strip_prefix('@') {
                let content = std::fs::read_to_string(file).map_err(|e| {
                    TetherError::Inventory(format!("cannot read target file {}: {}", file, e))
                })?;
                let extra: Vec<String> = content
                    .lines()
                    .map(str::trim)
                    .filter(|l| !l.is_empty() && !l.starts_with('#'))
                    .map(str::to_string)
                    .collect();
                parts.splice(i..i, extra);
                continue;
            }

            for target in self.resolve_part(&part)? {
                if !names.contains(&target.name) {
                    names.push(target.name.clone());
                    resolved.push(target);
                }
            }
        }
        Ok(resolved)
    }

    fn resolve_part(&self, part: &str) -> Result<Vec<Target>> {
        if part == "all" {
            return Ok(self.targets.iter().map(|t| self.with_facts(t.clone())).collect());
        }
        if let Some(members) = self.groups.get(part) {
            return Ok(members.iter().filter_map(|n| self.get(n)).collect());
        }
        if let Some(target) = self.get(part) {
            return Ok(vec![target]);
        }
        if (part.contains('*') || part.contains('?')) && !part.contains("://") {
            let matched: Vec<Target> = self
                .targets
                .iter()
                .filter(|t| glob_match(part, &t.name))
                .map(|t| self.with_facts(t.clone()))
                .collect();
            if matched.is_empty() {
                warn!("Pattern '{}' matched no targets", part);
            }
            return Ok(matched);
        }

        // Not in the inventory: a literal URI under the top-level layer
        let target = self.build_target(part, &[&self.top])?;
        Ok(vec![self.with_facts(target)])
    }
}

impl TargetResolver for Inventory {
    fn resolve(&self, expression: &str) -> Result<Vec<Target>> {
        self.resolve_from(expression, &mut std::io::stdin())
    }

    fn add_facts(&self, target: &str, facts: &Map<String, Value>) -> Result<()> {
        let mut store = self.facts.write().unwrap_or_else(|e| e.into_inner());
        let entry = store.entry(target.to_string()).or_default();
        for (key, value) in facts {
            entry.insert(key.clone(), value.clone());
        }
        debug!("Added {} facts to {}", facts.len(), target);
        Ok(())
    }
}

/// Comma-separated parts, ignoring blanks
fn split_expression(expression: &str) -> Vec<String> {
    expression
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect()
}

/// Shell-style glob over `*` and `?`
pub fn glob_match(pattern: &str, name: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let n: Vec<char> = name.chars().collect();
    let (mut pi, mut ni) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ni < n.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == n[ni]) {
            pi += 1;
            ni += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ni));
            pi += 1;
        } else if let Some((sp, sn)) = star {
            pi = sp + 1;
            ni = sn + 1;
            star = Some((sp, sn + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|&c| c == '*')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use tempfile::TempDir;

    const INVENTORY: &str = r#"
config:
  ssh:
    user: deploy
facts:
  env: prod
targets:
  - localhost
groups:
  - name: web
    config:
      ssh:
        port: 2222
    features: [agent]
    targets:
      - web1.example.com
      - uri: ssh://web2.example.com
        alias: w2
        config:
          ssh:
            user: admin
    groups:
      - name: canary
        facts:
          canary: true
        targets:
          - web3.example.com
  - name: windows
    config:
      transport: winrm
      winrm:
        user: Administrator
    targets:
      - win1.example.com
"#;

    fn inventory() -> Inventory {
        Inventory::from_yaml(INVENTORY, ProjectConfig::default()).unwrap()
    }

    fn names(targets: &[Target]) -> Vec<String> {
        targets.iter().map(|t| t.name.clone()).collect()
    }

    fn resolve(inv: &Inventory, expr: &str) -> Vec<String> {
        names(&inv.resolve_from(expr, &mut Cursor::new("")).unwrap())
    }

    #[test]
    fn test_option_layering() {
        let inv = inventory();
        let web1 = inv.get("web1.example.com").unwrap();
        assert_eq!(web1.config.get_str("user"), Some("deploy"));
        assert_eq!(web1.config.get_u64("port"), Some(2222));
        assert!(web1.has_feature("agent"));
        assert_eq!(web1.facts["env"], "prod");

        // Target config beats group config
        let web2 = inv.get("w2").unwrap();
        assert_eq!(web2.name, "ssh://web2.example.com");
        assert_eq!(web2.config.get_str("user"), Some("admin"));

        let web3 = inv.get("web3.example.com").unwrap();
        assert_eq!(web3.facts["canary"], true);
        assert_eq!(web3.config.get_u64("port"), Some(2222));
    }

    #[test]
    fn test_uri_values_win() {
        let inv = inventory();
        let target = &inv.resolve_from("ssh://root@db1:2200", &mut Cursor::new("")).unwrap()[0];
        assert_eq!(target.config.get_str("user"), Some("root"));
        assert_eq!(target.config.get_u64("port"), Some(2200));
    }

    #[test]
    fn test_group_transport_override() {
        let inv = inventory();
        let win = inv.get("win1.example.com").unwrap();
        assert_eq!(win.transport, TransportKind::Winrm);
        assert_eq!(win.config.get_str("user"), Some("Administrator"));
    }

    #[test]
    fn test_group_includes_nested_members() {
        let inv = inventory();
        assert_eq!(
            resolve(&inv, "web"),
            vec!["web1.example.com", "ssh://web2.example.com", "web3.example.com"]
        );
        assert_eq!(resolve(&inv, "canary"), vec!["web3.example.com"]);
    }

    #[test]
    fn test_expression_dedup_and_glob() {
        let inv = inventory();
        assert_eq!(
            resolve(&inv, "canary, web*.example.com ,w2"),
            vec!["web3.example.com", "web1.example.com", "ssh://web2.example.com"]
        );
        assert_eq!(resolve(&inv, "all").len(), 5);
        assert!(resolve(&inv, "nomatch*").is_empty());
    }

    #[test]
    fn test_stdin_and_file_parts() {
        let inv = inventory();
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("targets.txt");
        std::fs::write(&file, "# web tier\nweb1.example.com\n\nnew1\n").unwrap();

        let expr = format!("@{},-", file.display());
        let resolved = inv
            .resolve_from(&expr, &mut Cursor::new("new2 new1\nlocalhost"))
            .unwrap();
        assert_eq!(
            names(&resolved),
            vec!["web1.example.com", "new1", "new2", "localhost"]
        );
        assert_eq!(resolved[1].config.get_str("user"), Some("deploy"));
        assert_eq!(resolved[3].transport, TransportKind::Local);
    }

    #[test]
    fn test_invalid_option_is_fatal() {
        let yaml = "config:\n  ssh:\n    port: not-a-port\ntargets: [web1]\n";
        assert!(Inventory::from_yaml(yaml, ProjectConfig::default()).is_err());
    }

    #[test]
    fn test_reserved_and_duplicate_groups() {
        let yaml = "groups:\n  - name: all\n    targets: [a]\n";
        assert!(Inventory::from_yaml(yaml, ProjectConfig::default()).is_err());
        let yaml = "groups:\n  - name: g\n  - name: g\n";
        assert!(Inventory::from_yaml(yaml, ProjectConfig::default()).is_err());
    }

    #[test]
    fn test_unknown_scheme_is_fatal() {
        let inv = inventory();
        assert!(matches!(
            inv.resolve_from("telnet://old-box", &mut Cursor::new("")),
            Err(TetherError::UnknownTransport(_))
        ));
    }

    #[test]
    fn test_fact_store() {
        let inv = inventory();
        let mut facts = Map::new();
        facts.insert("kernel".to_string(), Value::from("6.1"));
        inv.add_facts("web1.example.com", &facts).unwrap();
        let web1 = &inv.resolve_from("web", &mut Cursor::new("")).unwrap()[0];
        assert_eq!(web1.facts["kernel"], "6.1");
        assert_eq!(web1.facts["env"], "prod");
    }

    #[test]
    fn test_glob_match() {
        assert!(glob_match("web*", "web1"));
        assert!(glob_match("w?b*.com", "web1.example.com"));
        assert!(!glob_match("db*", "web1"));
        assert!(glob_match("*", ""));
    }
}
