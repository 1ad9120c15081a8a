use uuid::Uuid;

use dvtoolbox_core::contract::{EntityRef, Record};
use dvtoolbox_core::descriptor::{
    ExtensionModule, ExtensionPoint, ImageDeclaration, ImageRole, TriggerStep,
};
use dvtoolbox_core::reconcile::ApplyMode;
use dvtoolbox_core::registration::{RegistrationOptions, RegistrationSync, RemovalKind};
use dvtoolbox_core::testing::{InMemoryRemote, RemoteCall};
use dvtoolbox_core::ToolboxError;

struct Environment {
    remote: InMemoryRemote,
    solution_id: Uuid,
}

fn environment() -> Environment {
    let remote = InMemoryRemote::new();
    let solution_id = remote.seed(Record::new("solution").set("uniquename", "Core"));
    let update = remote.seed(Record::new("sdkmessage").set("name", "Update"));
    remote.seed(
        Record::new("sdkmessagefilter")
            .set("primaryobjecttypecode", "account")
            .set("sdkmessageid", update),
    );
    Environment {
        remote,
        solution_id,
    }
}

fn step(id: Uuid, name: &str, images: Vec<ImageDeclaration>) -> TriggerStep {
    TriggerStep {
        id,
        name: name.to_string(),
        description: Some("Keeps the account name tidy".to_string()),
        message: "Update".to_string(),
        entity: Some("account".to_string()),
        stage: 40,
        mode: 0,
        rank: 1,
        supported_deployment: 0,
        async_auto_delete: 0,
        filtering_attributes: vec!["name".to_string(), "accountnumber".to_string()],
        images,
    }
}

fn module(point_id: Uuid, steps: Vec<TriggerStep>) -> ExtensionModule {
    ExtensionModule {
        name: "Contoso.Plugins".to_string(),
        version: "1.2.0.0".to_string(),
        module: None,
        extension_points: vec![ExtensionPoint {
            id: point_id,
            full_name: "Contoso.Plugins.AccountPlugin".to_string(),
            type_name: "AccountPlugin".to_string(),
            description: Some("x".repeat(300)),
            steps,
        }],
    }
}

fn pre_image() -> ImageDeclaration {
    ImageDeclaration {
        role: ImageRole::Pre,
        attributes: vec!["name".to_string()],
    }
}

fn post_image() -> ImageDeclaration {
    ImageDeclaration {
        role: ImageRole::Post,
        attributes: vec!["name".to_string()],
    }
}

fn options(sync_remote: bool, mode: ApplyMode) -> RegistrationOptions {
    RegistrationOptions {
        solution: Some("Core".to_string()),
        sync_remote,
        mode,
        assembly_only: false,
    }
}

fn component_types(remote: &InMemoryRemote) -> Vec<i64> {
    remote
        .executed()
        .iter()
        .filter(|r| r.name == "AddSolutionComponent")
        .filter_map(|r| r.parameters["ComponentType"].as_i64())
        .collect()
}

#[tokio::test]
async fn test_first_registration_creates_everything_in_the_solution() {
    let env = environment();
    let point_id = Uuid::new_v4();
    let step_id = Uuid::new_v4();
    let module = module(point_id, vec![step(step_id, "Account: Update", vec![pre_image()])]);

    let report = RegistrationSync::new(&env.remote, options(false, ApplyMode::Apply))
        .register_with_content(&module, b"compiled module")
        .await
        .expect("registration should succeed");

    assert_eq!(
        report.created,
        vec![
            "plugin assembly Contoso.Plugins",
            "plugin type Contoso.Plugins.AccountPlugin",
            "step Account: Update",
            "Pre entity image of Account: Update",
        ]
    );
    assert!(report.updated.is_empty());
    assert_eq!(component_types(&env.remote), vec![91, 92]);

    let assembly = env.remote.find("pluginassembly", report.assembly_id.unwrap()).unwrap();
    assert_eq!(assembly.text("version"), Some("1.2.0.0"));
    assert_eq!(assembly.int("isolationmode"), Some(2));

    let plugin_type =
        env.remote.find("plugintype", point_id).expect("plugin type keeps its declared id");
    assert_eq!(plugin_type.text("description").map(|d| d.chars().count()), Some(256));

    let registered = env
        .remote
        .find("sdkmessageprocessingstep", step_id)
        .expect("step keeps its declared id");
    assert_eq!(registered.text("filteringattributes"), Some("name,accountnumber"));
    assert_eq!(registered.int("stage"), Some(40));
    assert_eq!(registered.uuid("plugintypeid"), Some(point_id));
    assert!(registered.uuid("sdkmessagefilterid").is_some());

    let images = env.remote.rows("sdkmessageprocessingstepimage");
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].text("entityalias"), Some("preEntityImage"));
    assert_eq!(images[0].text("messagepropertyname"), Some("Target"));

    let members = env
        .remote
        .rows("solutioncomponent")
        .into_iter()
        .filter(|c| c.uuid("solutionid") == Some(env.solution_id))
        .count();
    assert_eq!(members, 2);
}

#[tokio::test]
async fn test_second_registration_only_updates() {
    let env = environment();
    let module = module(
        Uuid::new_v4(),
        vec![step(Uuid::new_v4(), "Account: Update", vec![pre_image()])],
    );
    let sync = RegistrationSync::new(&env.remote, options(false, ApplyMode::Apply));
    sync.register_with_content(&module, b"v1").await.unwrap();
    let creates_before = env
        .remote
        .mutations()
        .iter()
        .filter(|c| matches!(c, RemoteCall::Create { .. }))
        .count();

    let report = sync.register_with_content(&module, b"v2").await.unwrap();

    assert!(report.created.is_empty());
    assert_eq!(report.updated.len(), 4);
    let creates_after = env
        .remote
        .mutations()
        .iter()
        .filter(|c| matches!(c, RemoteCall::Create { .. }))
        .count();
    assert_eq!(creates_before, creates_after);
    assert_eq!(component_types(&env.remote), vec![91, 92]);
    assert_eq!(env.remote.rows("sdkmessageprocessingstepimage").len(), 1);
}

#[tokio::test]
async fn test_assembly_only_stops_after_the_assembly() {
    let env = environment();
    let module = module(Uuid::new_v4(), vec![step(Uuid::new_v4(), "Account: Update", vec![])]);
    let mut opts = options(false, ApplyMode::Apply);
    opts.assembly_only = true;

    let report = RegistrationSync::new(&env.remote, opts)
        .register_with_content(&module, b"bytes")
        .await
        .unwrap();
    assert_eq!(report.created, vec!["plugin assembly Contoso.Plugins"]);
    assert!(env.remote.rows("plugintype").is_empty());
}

#[tokio::test]
async fn test_ambiguous_assembly_aborts_before_any_write() {
    let env = environment();
    env.remote.seed(Record::new("pluginassembly").set("name", "Contoso.Plugins"));
    env.remote.seed(Record::new("pluginassembly").set("name", "Contoso.Plugins"));
    let module = module(Uuid::new_v4(), vec![]);

    let result = RegistrationSync::new(&env.remote, options(false, ApplyMode::Apply))
        .register_with_content(&module, b"bytes")
        .await;
    match result {
        Err(ToolboxError::AmbiguousIdentity { entity, count, .. }) => {
            assert_eq!(entity, "pluginassembly");
            assert_eq!(count, 2);
        }
        other => panic!("expected ambiguous identity, got {other:?}"),
    }
    assert!(env.remote.mutations().is_empty());
}

#[tokio::test]
async fn test_ambiguous_message_aborts_the_run() {
    let env = environment();
    env.remote.seed(Record::new("sdkmessage").set("name", "Update"));
    let step_id = Uuid::new_v4();
    let module = module(Uuid::new_v4(), vec![step(step_id, "Account: Update", vec![])]);

    let result = RegistrationSync::new(&env.remote, options(false, ApplyMode::Apply))
        .register_with_content(&module, b"bytes")
        .await;
    assert!(matches!(result, Err(ToolboxError::AmbiguousIdentity { .. })));
    assert!(env.remote.find("sdkmessageprocessingstep", step_id).is_none());
    assert!(env.remote.mutations().is_empty(), "nothing may be written before the abort");
}

#[tokio::test]
async fn test_ambiguous_message_aborts_before_remote_sync_deletes() {
    let point_id = Uuid::new_v4();
    let keep = Uuid::new_v4();
    let (env, customizable, _) = environment_with_extra_steps(point_id, keep).await;
    env.remote.seed(Record::new("sdkmessage").set("name", "Update"));
    let before = env.remote.mutations().len();
    let module = module(point_id, vec![step(keep, "Account: Update", vec![])]);

    let result = RegistrationSync::new(&env.remote, options(true, ApplyMode::Apply))
        .register_with_content(&module, b"bytes")
        .await;
    assert!(matches!(result, Err(ToolboxError::AmbiguousIdentity { .. })));
    assert_eq!(env.remote.mutations().len(), before);
    assert!(env.remote.find("sdkmessageprocessingstep", customizable).is_some());
}

#[tokio::test]
async fn test_step_description_is_capped() {
    let env = environment();
    let step_id = Uuid::new_v4();
    let mut long = step(step_id, "Account: Update", vec![]);
    long.description = Some("d".repeat(400));
    let module = module(Uuid::new_v4(), vec![long]);

    RegistrationSync::new(&env.remote, options(false, ApplyMode::Apply))
        .register_with_content(&module, b"bytes")
        .await
        .expect("registration should succeed");

    let registered = env.remote.find("sdkmessageprocessingstep", step_id).unwrap();
    assert_eq!(registered.text("description").map(|d| d.chars().count()), Some(256));
}

#[tokio::test]
async fn test_unknown_message_is_not_found() {
    let env = environment();
    let mut unknown = step(Uuid::new_v4(), "Account: Merge", vec![]);
    unknown.message = "Merge".to_string();
    let module = module(Uuid::new_v4(), vec![unknown]);

    let result = RegistrationSync::new(&env.remote, options(false, ApplyMode::Apply))
        .register_with_content(&module, b"bytes")
        .await;
    assert!(matches!(result, Err(ToolboxError::NotFound { .. })));
}

/// Registers `keep` plus two extra remote steps, one customizable.
async fn environment_with_extra_steps(point_id: Uuid, keep: Uuid) -> (Environment, Uuid, Uuid) {
    let env = environment();
    let module = module(point_id, vec![step(keep, "Account: Update", vec![])]);
    RegistrationSync::new(&env.remote, options(false, ApplyMode::Apply))
        .register_with_content(&module, b"bytes")
        .await
        .unwrap();

    let plugin_type = EntityRef::new("plugintype", point_id);
    let customizable = env.remote.seed(
        Record::new("sdkmessageprocessingstep")
            .set("name", "Account: Create (old)")
            .set("plugintypeid", plugin_type.clone())
            .set("iscustomizable", true),
    );
    let managed = env.remote.seed(
        Record::new("sdkmessageprocessingstep")
            .set("name", "Account: Delete (managed)")
            .set("plugintypeid", plugin_type)
            .set("iscustomizable", false),
    );
    (env, customizable, managed)
}

#[tokio::test]
async fn test_remote_sync_dry_run_only_reports_extra_steps() {
    let point_id = Uuid::new_v4();
    let keep = Uuid::new_v4();
    let (env, customizable, managed) = environment_with_extra_steps(point_id, keep).await;
    let deletes_before = env.remote.mutations().len();

    let module = module(point_id, vec![step(keep, "Account: Update", vec![])]);
    let report = RegistrationSync::new(&env.remote, options(true, ApplyMode::DryRun))
        .register_with_content(&module, b"bytes")
        .await
        .unwrap();

    let mut pending: Vec<(RemovalKind, Uuid, bool)> = report
        .pending_removals
        .iter()
        .map(|p| (p.kind, p.id, p.customizable))
        .collect();
    pending.sort_by_key(|(_, id, _)| *id);
    let mut expected = vec![
        (RemovalKind::Step, customizable, true),
        (RemovalKind::Step, managed, false),
    ];
    expected.sort_by_key(|(_, id, _)| *id);
    assert_eq!(pending, expected);
    assert!(report.removed.is_empty());
    assert!(env.remote.find("sdkmessageprocessingstep", customizable).is_some());
    assert!(!env.remote.mutations()[deletes_before..]
        .iter()
        .any(|c| matches!(c, RemoteCall::Delete { .. })));
}

#[tokio::test]
async fn test_remote_sync_apply_deletes_only_customizable_steps() {
    let point_id = Uuid::new_v4();
    let keep = Uuid::new_v4();
    let (env, customizable, managed) = environment_with_extra_steps(point_id, keep).await;

    let module = module(point_id, vec![step(keep, "Account: Update", vec![])]);
    let report = RegistrationSync::new(&env.remote, options(true, ApplyMode::Apply))
        .register_with_content(&module, b"bytes")
        .await
        .unwrap();

    assert_eq!(report.removed, vec!["Account: Create (old)"]);
    assert_eq!(report.pending_removals.len(), 1);
    assert_eq!(report.pending_removals[0].id, managed);
    assert!(env.remote.find("sdkmessageprocessingstep", customizable).is_none());
    assert!(env.remote.find("sdkmessageprocessingstep", managed).is_some());
    assert!(env.remote.find("sdkmessageprocessingstep", keep).is_some());
}

#[tokio::test]
async fn test_remote_sync_detects_a_dropped_image() {
    let env = environment();
    let point_id = Uuid::new_v4();
    let step_id = Uuid::new_v4();
    let with_both = module(
        point_id,
        vec![step(step_id, "Account: Update", vec![pre_image(), post_image()])],
    );
    RegistrationSync::new(&env.remote, options(false, ApplyMode::Apply))
        .register_with_content(&with_both, b"bytes")
        .await
        .unwrap();
    for image in env.remote.rows("sdkmessageprocessingstepimage") {
        let id = image.record_id().unwrap();
        env.remote
            .modify("sdkmessageprocessingstepimage", id, |row| row.insert("iscustomizable", true));
    }

    let pre_only = module(point_id, vec![step(step_id, "Account: Update", vec![pre_image()])]);
    let report = RegistrationSync::new(&env.remote, options(true, ApplyMode::Apply))
        .register_with_content(&pre_only, b"bytes")
        .await
        .unwrap();

    assert_eq!(report.removed.len(), 1);
    assert!(report.removed[0].contains("postEntityImage"));
    let remaining = env.remote.rows("sdkmessageprocessingstepimage");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].text("entityalias"), Some("preEntityImage"));
}

#[tokio::test]
async fn test_plugin_type_missing_locally_is_reported_not_deleted() {
    let env = environment();
    let kept = Uuid::new_v4();
    let dropped = Uuid::new_v4();
    let mut both = module(kept, vec![]);
    let mut second = module(dropped, vec![]).extension_points.remove(0);
    second.full_name = "Contoso.Plugins.ContactPlugin".to_string();
    both.extension_points.push(second);
    RegistrationSync::new(&env.remote, options(false, ApplyMode::Apply))
        .register_with_content(&both, b"bytes")
        .await
        .unwrap();

    let report = RegistrationSync::new(&env.remote, options(true, ApplyMode::Apply))
        .register_with_content(&module(kept, vec![]), b"bytes")
        .await
        .unwrap();

    assert_eq!(report.pending_removals.len(), 1);
    assert_eq!(report.pending_removals[0].kind, RemovalKind::ExtensionPoint);
    assert_eq!(report.pending_removals[0].name, "Contoso.Plugins.ContactPlugin");
    assert!(env.remote.find("plugintype", dropped).is_some());
}

#[tokio::test]
async fn test_images_on_a_message_without_images_are_rejected() {
    let env = environment();
    let mut retrieve = step(Uuid::new_v4(), "Account: Retrieve", vec![pre_image()]);
    retrieve.message = "Retrieve".to_string();
    let module = module(Uuid::new_v4(), vec![retrieve]);

    let result = RegistrationSync::new(&env.remote, options(false, ApplyMode::Apply))
        .register_with_content(&module, b"bytes")
        .await;
    assert!(matches!(result, Err(ToolboxError::Descriptor(_))));
    assert!(env.remote.mutations().is_empty());
}
