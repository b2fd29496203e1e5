use std::{fs, sync::Arc, thread};

use stackctl::{
    compose::{ComposeDocument, update_manifest},
    database::{DatabaseEngine, DatabaseInstanceConfig, DatabaseRole, host_port},
};
use strum::IntoEnumIterator;
use tempfile::tempdir;

fn database(role: DatabaseRole, engine: DatabaseEngine) -> DatabaseInstanceConfig {
    let mut db = DatabaseInstanceConfig::new(engine, role);
    db.password = "s3cret".to_string();
    db
}

#[test]
fn database_entries_merge_without_touching_each_other() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("docker/databases.yaml");

    let system = database(DatabaseRole::System, DatabaseEngine::Postgres);
    let project = database(DatabaseRole::Project, DatabaseEngine::Mysql);

    update_manifest(&path, |doc| doc.upsert_service("system", system.service_spec())).unwrap();
    update_manifest(&path, |doc| doc.upsert_service("project", project.service_spec())).unwrap();

    let doc = ComposeDocument::load(&path).unwrap();
    assert_eq!(doc.services.len(), 2);
    assert_eq!(doc.services["system"], system.service_spec());
    assert_eq!(doc.services["project"], project.service_spec());
    assert!(doc.volumes.contains_key(&system.volume_name()));
    assert!(doc.volumes.contains_key(&project.volume_name()));

    // Replacing the project engine leaves the system entry byte-for-byte intact.
    let replacement = database(DatabaseRole::Project, DatabaseEngine::Redis);
    update_manifest(&path, |doc| {
        doc.remove_service(&project.container_name());
        doc.upsert_service("project", replacement.service_spec());
    })
    .unwrap();

    let doc = ComposeDocument::load(&path).unwrap();
    assert_eq!(doc.services["system"], system.service_spec());
    assert_eq!(doc.services["project"].container_name, replacement.container_name());
    assert!(!doc.volumes.contains_key(&project.volume_name()));
}

#[test]
fn removing_the_last_entry_deletes_the_file() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("databases.yaml");
    let db = database(DatabaseRole::System, DatabaseEngine::Mongodb);

    update_manifest(&path, |doc| doc.upsert_service("system", db.service_spec())).unwrap();
    assert!(path.exists());

    let (doc, removed) = update_manifest(&path, |doc| doc.remove_service(&db.container_name())).unwrap();
    assert!(removed.is_some());
    assert!(doc.is_empty());
    assert!(!path.exists());

    let (_, removed) = update_manifest(&path, |doc| doc.remove_service(&db.container_name())).unwrap();
    assert!(removed.is_none());
    assert!(!path.exists());
}

#[test]
fn concurrent_writers_do_not_lose_entries() {
    let temp = tempdir().unwrap();
    let path = Arc::new(temp.path().join("databases.yaml"));

    let writers: Vec<_> = [DatabaseRole::System, DatabaseRole::Project]
        .into_iter()
        .flat_map(|role| DatabaseEngine::iter().map(move |engine| (role, engine)))
        .map(|(role, engine)| {
            let path = Arc::clone(&path);
            thread::spawn(move || {
                let db = database(role, engine);
                let key = db.container_name();
                update_manifest(&path, |doc| doc.upsert_service(&key, db.service_spec())).unwrap();
            })
        })
        .collect();
    for writer in writers {
        writer.join().unwrap();
    }

    let doc = ComposeDocument::load(&path).unwrap();
    assert_eq!(doc.services.len(), 2 * DatabaseEngine::iter().count());
}

#[test]
fn unreadable_manifest_is_discarded_on_update() {
    let temp = tempdir().unwrap();
    let path = temp.path().join("databases.yaml");
    fs::write(&path, "services: [this is: not, a mapping").unwrap();

    assert!(ComposeDocument::load(&path).is_err());

    let db = database(DatabaseRole::System, DatabaseEngine::Redis);
    update_manifest(&path, |doc| doc.upsert_service("system", db.service_spec())).unwrap();
    let doc = ComposeDocument::load(&path).unwrap();
    assert_eq!(doc.services.len(), 1);
}

#[test]
fn host_ports_are_deterministic_and_role_separated() {
    for engine in DatabaseEngine::iter() {
        let system = host_port(DatabaseRole::System, engine);
        let project = host_port(DatabaseRole::Project, engine);
        assert_eq!(system, engine.base_port());
        assert_eq!(project, engine.base_port() + 1000);
        assert_eq!(
            database(DatabaseRole::Project, engine).service_spec().ports,
            vec![format!("{project}:{}", engine.base_port())]
        );
    }
    assert_eq!(host_port(DatabaseRole::Project, DatabaseEngine::Postgres), 6432);
    assert_eq!(
        DatabaseInstanceConfig::new(DatabaseEngine::Postgres, DatabaseRole::Project)
            .container_name(),
        "stackctl-project-postgres"
    );
}
