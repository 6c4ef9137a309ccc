//! Lua-level end-to-end scenarios: script in, definition out.

use prost::Message;

use luakit_llb::{pb, serialize, SerializeOptions};
use luakit_script::{Evaluator, ScriptError};

fn decode_ops(def: &pb::Definition) -> Vec<pb::Op> {
    def.def
        .iter()
        .map(|bytes| pb::Op::decode(bytes.as_slice()).unwrap())
        .collect()
}

async fn definition_for(script: &str) -> pb::Definition {
    let evaluator = Evaluator::new().unwrap();
    let output = evaluator.evaluate_source("build.lua", script).unwrap();
    let opts = SerializeOptions {
        image_config: output.image_config.clone(),
        source_files: output.sources.clone(),
        ..Default::default()
    };
    serialize(&output.exported, opts).await.unwrap()
}

#[tokio::test]
async fn image_run_export_produces_a_solvable_shape() {
    let def = definition_for(
        "local b = bk.image(\"alpine:3.19\")\nlocal r = b:run(\"echo hi\")\nbk.export(r)",
    )
    .await;
    let ops = decode_ops(&def);
    assert!(ops.len() >= 3);

    let source = ops
        .iter()
        .find_map(|op| match &op.op {
            Some(pb::op::Op::Source(src)) => Some(src.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(source.identifier, "docker-image://docker.io/library/alpine:3.19");

    let exec = ops
        .iter()
        .find_map(|op| match &op.op {
            Some(pb::op::Op::Exec(exec)) => Some(exec.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(
        exec.meta.as_ref().unwrap().args,
        vec!["/bin/sh", "-c", "echo hi"]
    );
    let rootfs = &exec.mounts[0];
    assert_eq!(rootfs.dest, "/");
    assert_eq!(rootfs.input, 0);
    assert_eq!(rootfs.mount_type, pb::MountType::Bind as i32);

    assert!(ops.last().unwrap().op.is_none());

    // One source file; the image call on line 1, the run on line 2.
    let source_map = def.source.as_ref().unwrap();
    assert_eq!(source_map.infos.len(), 1);
    assert_eq!(source_map.infos[0].filename, "build.lua");
    let lines: Vec<i32> = source_map
        .locations
        .values()
        .map(|locs| locs.locations[0].ranges[0].start.as_ref().unwrap().line)
        .collect();
    assert!(lines.contains(&1));
    assert!(lines.contains(&2));
}

#[tokio::test]
async fn merge_scenario_emits_one_source_two_execs_and_a_merge() {
    let def = definition_for(
        "local b = bk.image(\"alpine:3.19\")\n\
         local a = b:run(\"echo a\")\n\
         local c = b:run(\"echo c\")\n\
         bk.export(bk.merge(a, c))",
    )
    .await;
    let ops = decode_ops(&def);
    assert_eq!(ops.len(), 5);

    let sources = ops
        .iter()
        .filter(|op| matches!(op.op, Some(pb::op::Op::Source(_))))
        .count();
    assert_eq!(sources, 1);

    let exec_digests: Vec<String> = ops
        .iter()
        .filter(|op| matches!(op.op, Some(pb::op::Op::Exec(_))))
        .map(|op| luakit_llb::digest_bytes(&op.encode_to_vec()))
        .collect();
    assert_eq!(exec_digests.len(), 2);

    let merge_op = ops
        .iter()
        .find(|op| matches!(op.op, Some(pb::op::Op::Merge(_))))
        .unwrap();
    assert_eq!(merge_op.inputs.len(), 2);
    // Merge inputs reference the two execs in script order.
    assert_eq!(merge_op.inputs[0].digest, exec_digests[0]);
    assert_eq!(merge_op.inputs[1].digest, exec_digests[1]);
}

#[tokio::test]
async fn export_options_become_the_image_config() {
    let evaluator = Evaluator::new().unwrap();
    let output = evaluator
        .evaluate_source(
            "build.lua",
            "local s = bk.scratch()\n\
             bk.export(s, {entrypoint = {\"/app/server\"}, env = {\"MODE=prod\"}, \
             workdir = \"/app\", user = \"app\", ports = {\"8080/tcp\"}, \
             labels = {[\"org.opencontainers.image.title\"] = \"server\"}})",
        )
        .unwrap();
    let config = output.image_config.unwrap();
    let settings = config.config.unwrap();
    assert_eq!(settings.entrypoint.unwrap(), vec!["/app/server"]);
    assert_eq!(settings.env, vec!["MODE=prod"]);
    assert_eq!(settings.working_dir, "/app");
    assert_eq!(settings.user, "app");
    assert!(settings.exposed_ports.unwrap().contains_key("8080/tcp"));
    assert_eq!(
        settings.labels.unwrap()["org.opencontainers.image.title"],
        "server"
    );
}

#[tokio::test]
async fn mount_factories_attach_to_run() {
    let def = definition_for(
        "local b = bk.image(\"rust:1.75\")\n\
         local deps = bk.local_(\"context\")\n\
         local r = b:run(\"cargo build\", {mounts = {\n\
           bk.cache(\"/root/.cargo\", {sharing = \"locked\"}),\n\
           bk.bind(deps, \"/src\"),\n\
           bk.tmpfs(\"/tmp\", {size = 1024}),\n\
           bk.secret(\"/run/secrets/token\"),\n\
           bk.ssh(),\n\
         }})\n\
         bk.export(r)",
    )
    .await;
    let exec = decode_ops(&def)
        .into_iter()
        .find_map(|op| match op.op {
            Some(pb::op::Op::Exec(exec)) => Some(exec),
            _ => None,
        })
        .unwrap();
    assert_eq!(exec.mounts.len(), 6);
    assert_eq!(exec.mounts[0].dest, "/");
    let cache = &exec.mounts[1];
    assert_eq!(cache.mount_type, pb::MountType::Cache as i32);
    assert_eq!(
        cache.cache_opt.as_ref().unwrap().sharing,
        pb::CacheSharingOpt::Locked as i32
    );
    let bind = &exec.mounts[2];
    assert_eq!(bind.mount_type, pb::MountType::Bind as i32);
    assert_eq!(bind.dest, "/src");
    assert_eq!(bind.input, 1);
    assert!(bind.readonly);
    assert_eq!(exec.mounts[3].mount_type, pb::MountType::Tmpfs as i32);
    assert_eq!(exec.mounts[3].tmpfs_opt.as_ref().unwrap().size, 1024);
    let secret = &exec.mounts[4];
    assert_eq!(secret.mount_type, pb::MountType::Secret as i32);
    assert_eq!(secret.secret_opt.as_ref().unwrap().id, "token");
    assert_eq!(exec.mounts[5].mount_type, pb::MountType::Ssh as i32);
}

#[tokio::test]
async fn file_methods_chain_through_states() {
    let def = definition_for(
        "local base = bk.scratch()\n\
         local ctx = bk.local_(\"context\")\n\
         local s = base:mkdir(\"/app\", {parents = true})\n\
         s = s:copy(ctx, \"/bin/tool\", \"/app/tool\", {mode = 493})\n\
         s = s:mkfile(\"/app/version\", \"1.0\")\n\
         s = s:symlink(\"/app/tool\", \"/usr/bin/tool\")\n\
         s = s:rm(\"/app/tool.bak\", {allow_not_found = true})\n\
         bk.export(s)",
    )
    .await;
    let ops = decode_ops(&def);
    let file_ops: Vec<pb::FileOp> = ops
        .iter()
        .filter_map(|op| match &op.op {
            Some(pb::op::Op::File(file)) => Some(file.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(file_ops.len(), 5);
    // Every file op here is a single action reading real input 0.
    for file in &file_ops {
        assert_eq!(file.actions.len(), 1);
        assert_eq!(file.actions[0].input, 0);
        assert_eq!(file.actions[0].output, 0);
    }
}

#[tokio::test]
async fn git_and_http_sources_round_trip() {
    let def = definition_for(
        "local repo = bk.git(\"https://github.com/org/repo.git\", {ref = \"v1.2\"})\n\
         local tool = bk.http(\"https://example.com/tool\", {filename = \"tool\", mode = 493})\n\
         bk.export(bk.merge(repo, tool))",
    )
    .await;
    let identifiers: Vec<String> = decode_ops(&def)
        .iter()
        .filter_map(|op| match &op.op {
            Some(pb::op::Op::Source(src)) => Some(src.identifier.clone()),
            _ => None,
        })
        .collect();
    assert!(identifiers.contains(&"git://github.com/org/repo.git#v1.2".to_string()));
    assert!(identifiers.contains(&"https://example.com/tool".to_string()));
}

#[test]
fn validation_failures_raise_at_the_call_site() {
    let evaluator = Evaluator::new().unwrap();

    let err = evaluator
        .evaluate_source("build.lua", "bk.export(bk.image(\"\"))")
        .unwrap_err();
    match err {
        ScriptError::Lua(lua) => assert!(lua.to_string().contains("empty image reference")),
        other => panic!("unexpected error {other}"),
    }

    let err = evaluator
        .evaluate_source("build.lua", "bk.export(bk[\"local\"](\"../escape\"))")
        .unwrap_err();
    assert!(matches!(err, ScriptError::Lua(_)));

    let err = evaluator
        .evaluate_source("build.lua", "bk.export(bk.merge(bk.scratch()))")
        .unwrap_err();
    match err {
        ScriptError::Lua(lua) => assert!(lua.to_string().contains("at least 2")),
        other => panic!("unexpected error {other}"),
    }

    let err = evaluator
        .evaluate_source("build.lua", "bk.export(bk.diff(nil, bk.scratch()))")
        .unwrap_err();
    assert!(matches!(err, ScriptError::Lua(_)));
}

#[test]
fn run_options_map_onto_the_exec() {
    let evaluator = Evaluator::new().unwrap();
    let output = evaluator
        .evaluate_source(
            "build.lua",
            "local b = bk.image(\"alpine\")\n\
             local r = b:run({\"id\"}, {env = {\"A=1\"}, cwd = \"/work\", user = \"nobody\",\n\
               network = \"none\", security = \"insecure\", hostname = \"bld\",\n\
               valid_exit_codes = {0, 2},\n\
               extra_hosts = {{host = \"mirror.internal\", ip = \"10.0.0.7\"}}})\n\
             bk.export(r)",
        )
        .unwrap();
    let op = output.exported.node().op_snapshot();
    let exec = match op.op.unwrap() {
        pb::op::Op::Exec(exec) => exec,
        other => panic!("unexpected op {other:?}"),
    };
    assert_eq!(exec.network, pb::NetMode::None as i32);
    assert_eq!(exec.security, pb::SecurityMode::Insecure as i32);
    let meta = exec.meta.unwrap();
    assert_eq!(meta.args, vec!["id"]);
    assert_eq!(meta.env, vec!["A=1"]);
    assert_eq!(meta.cwd, "/work");
    assert_eq!(meta.user, "nobody");
    assert_eq!(meta.hostname, "bld");
    assert_eq!(meta.valid_exit_codes, vec![0, 2]);
    assert_eq!(meta.extra_hosts.len(), 1);
    assert_eq!(meta.extra_hosts[0].host, "mirror.internal");
    assert_eq!(meta.extra_hosts[0].ip, "10.0.0.7");
}

#[test]
fn with_platform_overrides_downstream_ops() {
    let evaluator = Evaluator::new().unwrap();
    let output = evaluator
        .evaluate_source(
            "build.lua",
            "local b = bk.image(\"alpine\", {platform = \"linux/arm64/v8\"})\n\
             bk.export(b)",
        )
        .unwrap();
    let platform = output.exported.platform().unwrap();
    assert_eq!(platform.architecture, "arm64");
    assert_eq!(platform.variant.as_deref(), Some("v8"));
}
