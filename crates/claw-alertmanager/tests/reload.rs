//! Configuration reload against a file-backed source.

mod common;

use std::sync::Arc;

use claw_alertmanager::{ConfigSource, FileConfigSource, RawAlert};
use common::{Recorder, document, engine, sleep_ms};

fn write_document(path: &std::path::Path, doc: &claw_alertmanager::ConfigDocument) {
    std::fs::write(path, doc.to_json().expect("json")).expect("write config");
}

#[tokio::test]
async fn unchanged_file_is_a_no_op() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = Arc::new(Recorder::default());
    let engine = engine(dir.path(), &recorder);

    let path = dir.path().join("config.json");
    write_document(&path, &document("100ms", "1h"));
    let source = Arc::new(FileConfigSource::new(&path));
    engine
        .start(Some(Arc::clone(&source) as Arc<dyn ConfigSource>))
        .await
        .expect("start");

    let hash = engine.config_hash().expect("hash");
    assert!(!engine.reload_config(source.as_ref()).await.expect("reload"));
    assert_eq!(engine.config_hash(), Some(hash));
    engine.shutdown().await;
}

#[tokio::test]
async fn broken_documents_keep_the_running_configuration() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = Arc::new(Recorder::default());
    let engine = engine(dir.path(), &recorder);

    let path = dir.path().join("config.json");
    write_document(&path, &document("100ms", "1h"));
    let source = FileConfigSource::new(&path);
    engine.reload_config(&source).await.expect("initial load");
    let hash = engine.config_hash();

    std::fs::write(&path, "{ not json").expect("write");
    assert!(engine.reload_config(&source).await.is_err());
    assert_eq!(engine.config_hash(), hash);

    let mut undefined = document("100ms", "1h");
    undefined.route.receiver = Some("nobody".into());
    write_document(&path, &undefined);
    assert!(engine.reload_config(&source).await.is_err());
    assert_eq!(engine.config_hash(), hash);
    assert_eq!(engine.config().expect("config").route.receiver.as_deref(), Some("team"));
    engine.shutdown().await;
}

#[tokio::test]
async fn reload_does_not_resend_delivered_notifications() {
    let dir = tempfile::tempdir().expect("tempdir");
    let recorder = Arc::new(Recorder::default());
    let engine = engine(dir.path(), &recorder);

    let path = dir.path().join("config.json");
    let mut doc = document("100ms", "1h");
    write_document(&path, &doc);
    let source = FileConfigSource::new(&path);
    engine.reload_config(&source).await.expect("initial load");

    engine
        .put_alerts(vec![RawAlert::new([("alertname", "NodeNotReady"), ("node", "n3")])])
        .expect("put");
    sleep_ms(300).await;
    assert_eq!(recorder.sent().len(), 1);

    doc.templates.insert("footer".into(), "runbook: https://runbooks/{{ group_labels.alertname }}".into());
    write_document(&path, &doc);
    assert!(engine.reload_config(&source).await.expect("reload"));
    assert!(dir.path().join("templates").join("footer.tmpl").exists());

    sleep_ms(300).await;
    assert_eq!(recorder.sent().len(), 1, "the notification log survives the reload");
    assert_eq!(engine.groups().len(), 1);
    engine.shutdown().await;
}
