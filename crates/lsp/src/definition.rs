//! Static descriptions of launchable language servers.
//!
//! A [`ServerDefinition`] says how to spawn a server, which document tags it
//! serves, and the protocol-facing knobs for one server kind. Definitions are
//! plain data: they are registered with the
//! [`SessionRegistry`](crate::SessionRegistry), which decides when a running
//! session is created from one.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::JsonValue;

/// Stable identifier of a server definition, as authored in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DefinitionId(pub String);

impl DefinitionId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for DefinitionId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for DefinitionId {
	fn from(id: &str) -> Self {
		Self(id.to_owned())
	}
}

/// How to launch a server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchSpec {
	/// Executable name or path.
	pub command: String,
	/// Arguments passed to the command.
	#[serde(default)]
	pub args: Vec<String>,
	/// Extra environment variables for the server process.
	#[serde(default)]
	pub env: HashMap<String, String>,
	/// Working directory. Defaults to the session scope's root.
	#[serde(default)]
	pub cwd: Option<PathBuf>,
}

impl LaunchSpec {
	pub fn new(command: impl Into<String>) -> Self {
		Self {
			command: command.into(),
			args: Vec::new(),
			env: HashMap::new(),
			cwd: None,
		}
	}

	pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.args = args.into_iter().map(Into::into).collect();
		self
	}

	pub fn env(mut self, env: HashMap<String, String>) -> Self {
		self.env = env;
		self
	}

	pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
		self.cwd = Some(cwd.into());
		self
	}
}

/// Static description of one language server kind.
///
/// The `languages` table serves two purposes: its keys are the classification
/// tags the registry matches documents against, and its values are the
/// protocol language ids reported in `didOpen` for documents carrying that
/// tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDefinition {
	pub id: DefinitionId,
	/// Human-readable name used in logs and user-facing notices.
	pub label: String,
	pub launch: LaunchSpec,
	/// Classification tag -> protocol language id.
	#[serde(default)]
	pub languages: HashMap<String, String>,
	/// Keep at most one session for this definition, shared across scopes.
	#[serde(default)]
	pub singleton: bool,
	/// Value passed as `initializationOptions` during the handshake.
	#[serde(default)]
	pub initialization_options: Option<JsonValue>,
	/// Settings served back for `workspace/configuration` requests.
	#[serde(default)]
	pub settings: Option<JsonValue>,
	#[serde(default)]
	pub enable_snippets: bool,
	/// Request document formatting during saves when the server yields no
	/// `willSaveWaitUntil` edits.
	#[serde(default)]
	pub format_on_save: bool,
	/// Bound on waiting for the session to become active, in seconds.
	#[serde(default = "default_activation_timeout_secs")]
	pub activation_timeout_secs: u64,
	/// Bound on the `willSaveWaitUntil` round trip, in seconds.
	#[serde(default = "default_will_save_timeout_secs")]
	pub will_save_timeout_secs: u64,
	/// Seconds an idle session (no documents attached) stays alive.
	/// `None` disables the idle shutdown.
	#[serde(default = "default_idle_timeout_secs")]
	pub idle_timeout_secs: Option<u64>,
}

fn default_activation_timeout_secs() -> u64 {
	10
}

fn default_will_save_timeout_secs() -> u64 {
	5
}

fn default_idle_timeout_secs() -> Option<u64> {
	Some(60)
}

impl Default for ServerDefinition {
	fn default() -> Self {
		Self {
			id: DefinitionId::new(""),
			label: String::new(),
			launch: LaunchSpec::new(""),
			languages: HashMap::new(),
			singleton: false,
			initialization_options: None,
			settings: None,
			enable_snippets: false,
			format_on_save: false,
			activation_timeout_secs: default_activation_timeout_secs(),
			will_save_timeout_secs: default_will_save_timeout_secs(),
			idle_timeout_secs: default_idle_timeout_secs(),
		}
	}
}

impl ServerDefinition {
	pub fn new(id: impl Into<DefinitionId>, command: impl Into<String>) -> Self {
		let id = id.into();
		Self {
			label: id.0.clone(),
			id,
			launch: LaunchSpec::new(command),
			..Default::default()
		}
	}

	pub fn label(mut self, label: impl Into<String>) -> Self {
		self.label = label.into();
		self
	}

	/// Declare that documents tagged `tag` are served with protocol language
	/// id `language_id`.
	pub fn language(mut self, tag: impl Into<String>, language_id: impl Into<String>) -> Self {
		self.languages.insert(tag.into(), language_id.into());
		self
	}

	pub fn singleton(mut self) -> Self {
		self.singleton = true;
		self
	}

	pub fn initialization_options(mut self, options: JsonValue) -> Self {
		self.initialization_options = Some(options);
		self
	}

	pub fn settings(mut self, settings: JsonValue) -> Self {
		self.settings = Some(settings);
		self
	}

	pub fn format_on_save(mut self) -> Self {
		self.format_on_save = true;
		self
	}

	pub fn idle_timeout(mut self, timeout: Option<Duration>) -> Self {
		self.idle_timeout_secs = timeout.map(|t| t.as_secs());
		self
	}

	pub fn activation_timeout(&self) -> Duration {
		Duration::from_secs(self.activation_timeout_secs)
	}

	pub fn will_save_timeout(&self) -> Duration {
		Duration::from_secs(self.will_save_timeout_secs)
	}

	pub fn idle_timeout_duration(&self) -> Option<Duration> {
		self.idle_timeout_secs.map(Duration::from_secs)
	}

	/// Protocol language id for a document, taking the first tag (most
	/// specific first) that this definition serves.
	pub fn language_for_tags<'a>(&'a self, tags: &[String]) -> Option<&'a str> {
		tags.iter()
			.find_map(|tag| self.languages.get(tag))
			.map(String::as_str)
	}

	pub fn serves_tag(&self, tag: &str) -> bool {
		self.languages.contains_key(tag)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn default_timeouts() {
		let def = ServerDefinition::new("rust-analyzer", "rust-analyzer");
		assert_eq!(def.activation_timeout(), Duration::from_secs(10));
		assert_eq!(def.will_save_timeout(), Duration::from_secs(5));
		assert_eq!(def.idle_timeout_duration(), Some(Duration::from_secs(60)));
	}

	#[test]
	fn language_lookup_prefers_most_specific_tag() {
		let def = ServerDefinition::new("ts", "typescript-language-server")
			.language("typescriptreact", "typescriptreact")
			.language("typescript", "typescript");
		let tags = vec!["typescriptreact".to_owned(), "typescript".to_owned()];
		assert_eq!(def.language_for_tags(&tags), Some("typescriptreact"));
		assert_eq!(def.language_for_tags(&["nope".to_owned()]), None);
	}

	#[test]
	fn deserializes_with_defaults() {
		let def: ServerDefinition = serde_json::from_str(
			r#"{
				"id": "gopls",
				"label": "gopls",
				"launch": { "command": "gopls" },
				"languages": { "go": "go" }
			}"#,
		)
		.unwrap();
		assert_eq!(def.id.as_str(), "gopls");
		assert!(!def.singleton);
		assert_eq!(def.idle_timeout_secs, Some(60));
		assert!(def.serves_tag("go"));
	}
}
