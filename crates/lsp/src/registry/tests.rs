use std::time::Duration;

use super::*;
use crate::testutil::{self, definition, doc, folder_caps, sync_options};

#[test]
fn test_register_definition_replaces_same_id() {
	let host = testutil::host();
	host.registry.register_definition(definition("alpha"));
	host.registry
		.register_definition(definition("alpha").label("Alpha II"));

	let defs = host.registry.definitions();
	assert_eq!(defs.len(), 1);
	assert_eq!(defs[0].label, "Alpha II");
}

#[tokio::test]
async fn test_resolve_unknown_definition_fails() {
	let host = testutil::host();
	let err = host
		.registry
		.resolve(&SessionScope::path("/tmp"), &DefinitionId::new("ghost"))
		.await
		.unwrap_err();
	assert!(matches!(err, Error::UnknownDefinition(_)));
}

#[tokio::test]
async fn test_resolve_singleflight() {
	let host = testutil::host();
	host.registry.register_definition(definition("alpha"));
	let script = host.servers.script("alpha");
	let release = script.hold_spawns();
	let scope = SessionScope::path("/tmp/p");

	let r1 = Arc::clone(&host.registry);
	let s1 = scope.clone();
	let h1 = tokio::spawn(async move { r1.resolve(&s1, &DefinitionId::new("alpha")).await });

	// Wait for the leader to reach the transport.
	script.spawn_entered().await;

	let r2 = Arc::clone(&host.registry);
	let s2 = scope.clone();
	let h2 = tokio::spawn(async move { r2.resolve(&s2, &DefinitionId::new("alpha")).await });

	// Give the second resolver a moment to be waiting on the outcome.
	tokio::time::sleep(Duration::from_millis(50)).await;
	release.notify_one();

	let (h1, h2) = tokio::join!(h1, h2);
	let a = h1.unwrap().unwrap();
	let b = h2.unwrap().unwrap();
	assert!(Arc::ptr_eq(&a, &b));
	assert_eq!(script.spawn_count(), 1);
	assert!(a.is_active());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_singleton_resolves_share_one_start_across_scopes() {
	// A singleton serves every scope from one session, so resolvers from
	// different scopes must coalesce on one start. The duplicate-leader
	// window only opens under truly parallel resolves; repeat the race.
	for _ in 0..25 {
		let host = testutil::host();
		host.registry
			.register_definition(definition("alpha").singleton());
		let script = host.servers.script("alpha");

		let r1 = Arc::clone(&host.registry);
		let h1 = tokio::spawn(async move {
			r1.resolve(&SessionScope::path("/tmp/a"), &DefinitionId::new("alpha"))
				.await
		});
		let r2 = Arc::clone(&host.registry);
		let h2 = tokio::spawn(async move {
			r2.resolve(&SessionScope::path("/tmp/b"), &DefinitionId::new("alpha"))
				.await
		});

		let (h1, h2) = tokio::join!(h1, h2);
		let a = h1.unwrap().unwrap();
		let b = h2.unwrap().unwrap();
		assert!(Arc::ptr_eq(&a, &b));
		assert_eq!(script.spawn_count(), 1);
		assert_eq!(host.registry.sessions().len(), 1);
	}
}

#[tokio::test]
async fn test_sessions_are_keyed_by_scope_and_definition() {
	let host = testutil::host();
	host.registry.register_definition(definition("alpha"));
	let id = DefinitionId::new("alpha");
	let here = SessionScope::path("/tmp/a");
	let there = SessionScope::path("/tmp/b");

	let first = host.registry.resolve(&here, &id).await.unwrap();
	let again = host.registry.resolve(&here, &id).await.unwrap();
	assert!(Arc::ptr_eq(&first, &again));

	// No folder support advertised, so a second scope means a second server.
	let other = host.registry.resolve(&there, &id).await.unwrap();
	assert!(!Arc::ptr_eq(&first, &other));
	assert_eq!(host.servers.script("alpha").spawn_count(), 2);
}

#[tokio::test]
async fn test_folder_capable_session_adopts_new_scope() {
	let host = testutil::host();
	host.registry.register_definition(definition("alpha"));
	let script = host.servers.script("alpha");
	script.set_capabilities(folder_caps(sync_options()));
	let id = DefinitionId::new("alpha");

	let first = host
		.registry
		.resolve(&SessionScope::path("/tmp/a"), &id)
		.await
		.unwrap();
	let second = host
		.registry
		.resolve(&SessionScope::path("/tmp/b"), &id)
		.await
		.unwrap();

	assert!(Arc::ptr_eq(&first, &second));
	assert_eq!(script.spawn_count(), 1);

	// The adopted scope is announced as an added workspace folder.
	script.wait_for("workspace/didChangeWorkspaceFolders", 1).await;
	let params = script.params("workspace/didChangeWorkspaceFolders").remove(0);
	assert_eq!(params["event"]["added"][0]["name"], "b");
}

#[tokio::test]
async fn test_resolve_for_document_walks_tags() {
	let host = testutil::host();
	host.registry
		.register_definition(ServerDefinition::new("alpha", "alpha").language("special", "special"));
	host.registry
		.register_definition(ServerDefinition::new("beta", "beta").language("general", "general"));
	host.registry.register_definition(
		ServerDefinition::new("gamma", "gamma").language("unrelated", "unrelated"),
	);
	let scope = SessionScope::path("/tmp/p");
	let doc = DocumentInfo::new(Url::parse("file:///tmp/p/a.txt").unwrap(), scope.clone())
		.tags(["special", "general"])
		.text("x");

	let sessions = host.registry.sessions_for_document(&doc).await;

	let ids: Vec<&str> = sessions
		.iter()
		.map(|s| s.definition().id.as_str())
		.collect();
	assert_eq!(ids, ["alpha", "beta"]);
	assert_eq!(host.servers.script("gamma").spawn_count(), 0);
	for session in &sessions {
		assert!(session.is_connected(&doc.uri));
	}
}

#[tokio::test]
async fn test_definition_matched_once_across_tags() {
	let host = testutil::host();
	host.registry.register_definition(
		ServerDefinition::new("alpha", "alpha")
			.language("special", "x")
			.language("general", "x"),
	);
	let scope = SessionScope::path("/tmp/p");
	let doc = DocumentInfo::new(Url::parse("file:///tmp/p/a.txt").unwrap(), scope.clone())
		.tags(["special", "general"])
		.text("x");

	let sessions = host.registry.sessions_for_document(&doc).await;
	assert_eq!(sessions.len(), 1);
	assert_eq!(host.servers.script("alpha").spawn_count(), 1);
}

#[tokio::test]
async fn test_disable_mapping_detaches_and_persists() {
	let host = testutil::host();
	host.registry.register_definition(definition("alpha"));
	let id = DefinitionId::new("alpha");
	let scope = SessionScope::path("/tmp/p");
	let uri = Url::parse("file:///tmp/p/a.txt").unwrap();

	let sessions = host
		.registry
		.open_document(doc("file:///tmp/p/a.txt", &scope, "text"))
		.await;
	assert_eq!(sessions.len(), 1);
	assert!(sessions[0].is_connected(&uri));

	host.registry.disable_mapping("plain", &id);
	assert!(!sessions[0].is_connected(&uri));
	assert!(!host.registry.mapping_enabled("plain", &id));
	assert_eq!(
		host.settings.get("lsp.mapping.plain.alpha"),
		Some("0".to_owned())
	);

	// A disabled mapping is skipped on the next resolve.
	let resolved = host
		.registry
		.sessions_for_document(&doc("file:///tmp/p/b.txt", &scope, "more"))
		.await;
	assert!(resolved.is_empty());

	// Re-enabling reattaches the documents that are still open.
	host.registry.enable_mapping("plain", &id).await;
	assert!(host.registry.mapping_enabled("plain", &id));
	let sessions = host.registry.sessions();
	assert!(sessions.iter().any(|s| s.is_connected(&uri)));
}

#[tokio::test]
async fn test_reenabled_mapping_opens_with_latest_text() {
	let host = testutil::host();
	host.registry.register_definition(definition("alpha"));
	let script = host.servers.script("alpha");
	let id = DefinitionId::new("alpha");
	let scope = SessionScope::path("/tmp/p");
	let uri = Url::parse("file:///tmp/p/a.txt").unwrap();

	host.registry
		.open_document(doc("file:///tmp/p/a.txt", &scope, "one"))
		.await;
	let batch = EditBatch::replace(Rope::from("one"), Rope::from("two"));
	host.registry.document_changed(&uri, &batch);

	host.registry.disable_mapping("plain", &id);
	host.registry.enable_mapping("plain", &id).await;

	script.wait_for("textDocument/didOpen", 2).await;
	let reopened = script.params("textDocument/didOpen").remove(1);
	assert_eq!(reopened["textDocument"]["text"], "two");
}

#[tokio::test]
async fn test_failed_start_is_not_cached() {
	let host = testutil::host();
	host.registry.register_definition(definition("alpha"));
	let script = host.servers.script("alpha");
	script.fail("initialize", "bad config");
	let scope = SessionScope::path("/tmp/p");
	let id = DefinitionId::new("alpha");

	let err = host.registry.resolve(&scope, &id).await.unwrap_err();
	assert!(matches!(err, Error::Server(_)));

	// The same key must be startable again once the server behaves.
	script.reset("initialize");
	let session = host.registry.resolve(&scope, &id).await.unwrap();
	assert!(session.is_active());
	assert_eq!(script.spawn_count(), 2);
}

#[tokio::test]
async fn test_shutdown_all_stops_sessions() {
	let host = testutil::host();
	host.registry.register_definition(definition("alpha"));
	host.registry.register_definition(definition("beta"));
	let scope = SessionScope::path("/tmp/p");

	let sessions = host
		.registry
		.open_document(doc("file:///tmp/p/a.txt", &scope, "x"))
		.await;
	assert_eq!(sessions.len(), 2);

	host.registry.shutdown_all().await;

	assert!(host.registry.sessions().is_empty());
	for id in ["alpha", "beta"] {
		let script = host.servers.script(id);
		assert_eq!(script.count("shutdown"), 1, "server {id}");
		assert_eq!(script.count("exit"), 1, "server {id}");
	}
}

#[tokio::test]
async fn test_close_document_detaches_everywhere() {
	let host = testutil::host();
	host.registry.register_definition(definition("alpha"));
	host.registry.register_definition(definition("beta"));
	let scope = SessionScope::path("/tmp/p");
	let uri = Url::parse("file:///tmp/p/a.txt").unwrap();

	let sessions = host
		.registry
		.open_document(doc("file:///tmp/p/a.txt", &scope, "x"))
		.await;
	assert_eq!(sessions.len(), 2);

	host.registry.close_document(&uri);
	for session in &sessions {
		assert!(!session.is_connected(&uri));
	}
	for id in ["alpha", "beta"] {
		let script = host.servers.script(id);
		script.wait_for("textDocument/didClose", 1).await;
	}
}
