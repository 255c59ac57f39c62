use std::sync::Arc;
use std::time::Duration;

use modcache_service::caching::{CacheError, Conditions};
use modcache_service::modules::ModuleBuilds;
use regex::Regex;

use crate::{CountingBuilder, FakeModule, setup_manager, spill_files, wait_for_spill};

fn features(ie: bool, webkit: bool) -> Conditions {
    Conditions::new()
        .with_feature("ie", ie)
        .with_feature("webkit", webkit)
}

#[tokio::test]
async fn test_provisional_key_is_refined() {
    let (manager, _work_dir) = setup_manager(0);
    let modules = ModuleBuilds::new(manager.clone(), false);
    let source = FakeModule::new("app.js");
    let builder = Arc::new(CountingBuilder::new().examining(&["ie"]));

    let first = modules
        .get_build(&source, builder.clone(), &features(true, true), false)
        .await
        .unwrap();
    assert_eq!(*first.content, "app.js#1 ie=true");
    assert_eq!(first.key, "has{ie}");
    assert_eq!(first.key_generators.to_string(), "has:[ie]");

    // `webkit` turned out to be irrelevant
    let second = modules
        .get_build(&source, builder.clone(), &features(true, false), false)
        .await
        .unwrap();
    assert!(second.from_cache);
    assert_eq!(second.content, first.content);

    let third = modules
        .get_build(&source, builder.clone(), &features(false, false), false)
        .await
        .unwrap();
    assert_eq!(*third.content, "app.js#2 ie=false");
    assert_eq!(builder.calls(), 2);

    let record = manager.current().module_builds().get("app.js").unwrap();
    assert_eq!(
        record.builds().entries().keys(),
        vec!["has{!ie}".to_owned(), "has{ie}".to_owned()]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_colliding_rekey_keeps_one_entry() {
    let (manager, _work_dir) = setup_manager(0);
    let modules = ModuleBuilds::new(manager.clone(), false);
    let source = Arc::new(FakeModule::new("app.js"));
    let builder = Arc::new(
        CountingBuilder::new()
            .examining(&["ie"])
            .with_delay(Duration::from_millis(50)),
    );

    // Both start out under different provisional keys and end up under `has{ie}`.
    let requests = [features(true, true), features(true, false)].map(|conditions| {
        let modules = modules.clone();
        let source = source.clone();
        let builder = builder.clone();
        tokio::spawn(async move {
            modules
                .get_build(source.as_ref(), builder, &conditions, false)
                .await
        })
    });
    for result in futures::future::join_all(requests).await {
        assert_eq!(result.unwrap().unwrap().key, "has{ie}");
    }
    assert_eq!(builder.calls(), 2);

    let record = manager.current().module_builds().get("app.js").unwrap();
    assert_eq!(record.builds().entries().keys(), vec!["has{ie}".to_owned()]);

    let winner = record.builds().entries().get("has{ie}").unwrap();
    wait_for_spill(&winner).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(spill_files(&manager).len(), 1);
}

#[tokio::test]
async fn test_changed_source_is_rebuilt() {
    let (manager, _work_dir) = setup_manager(0);
    let modules = ModuleBuilds::new(manager.clone(), false);
    let source = FakeModule::new("app.js");
    let builder = Arc::new(CountingBuilder::new());

    let first = modules
        .get_build(&source, builder.clone(), &Conditions::new(), false)
        .await
        .unwrap();
    assert_eq!(first.key, "nokey");
    let record = manager.current().module_builds().get("app.js").unwrap();
    let old_entry = record.builds().entries().get("nokey").unwrap();
    wait_for_spill(&old_entry).await;
    let old_file = old_entry.spill_name().unwrap();

    source.touch(Duration::from_secs(10));
    let second = modules
        .get_build(&source, builder.clone(), &Conditions::new(), false)
        .await
        .unwrap();
    assert_eq!(*second.content, "app.js#2");
    assert!(!second.from_cache);

    // the superseded build is deleted after the grace delay
    crate::wait_for_deletion(&manager, &old_file).await;
}

#[tokio::test]
async fn test_missing_source() {
    let (manager, _work_dir) = setup_manager(0);
    let modules = ModuleBuilds::new(manager.clone(), false);
    let source = FakeModule::new("gone.js");
    source.delete();

    let err = modules
        .get_build(&source, Arc::new(CountingBuilder::new()), &Conditions::new(), false)
        .await
        .unwrap_err();
    assert_eq!(err, CacheError::NotFound("gone.js".into()));
}

#[tokio::test]
async fn test_ignore_cached_requires_development_mode() {
    let (manager, _work_dir) = setup_manager(0);
    let source = FakeModule::new("app.js");
    let builder = Arc::new(CountingBuilder::new());

    let production = ModuleBuilds::new(manager.clone(), false);
    for _ in 0..2 {
        production
            .get_build(&source, builder.clone(), &Conditions::new(), true)
            .await
            .unwrap();
    }
    assert_eq!(builder.calls(), 1);

    let development = ModuleBuilds::new(manager.clone(), true);
    for _ in 0..2 {
        let build = development
            .get_build(&source, builder.clone(), &Conditions::new(), true)
            .await
            .unwrap();
        assert!(!build.from_cache);
    }
    assert_eq!(builder.calls(), 3);
}

#[tokio::test]
async fn test_dump() {
    let (manager, _work_dir) = setup_manager(0);
    let modules = ModuleBuilds::new(manager.clone(), false);
    let builder = Arc::new(CountingBuilder::new().examining(&["ie"]));
    for module in ["app.js", "lib/util.js"] {
        modules
            .get_build(&FakeModule::new(module), builder.clone(), &features(true, true), false)
            .await
            .unwrap();
    }

    let mut out = Vec::new();
    let filter = Regex::new("^lib/").unwrap();
    manager.current().dump(&mut out, Some(&filter)).unwrap();
    let out = String::from_utf8(out).unwrap();

    assert!(out.contains("module: lib/util.js\n"));
    assert!(out.contains("\tkey generators: has:[ie]\n"));
    assert!(out.contains("modules key: has{ie}\n"));
    assert!(!out.contains("app.js"));
}
