//! End-to-end checks of definition assembly through the public API.

use prost::Message;

use luakit_llb::{
    image, merge, pb, run, serialize, ImageConfig, ImageOptions, ImageSettings, Origin,
    RunOptions, SerializeOptions,
};

fn decode_ops(def: &pb::Definition) -> Vec<pb::Op> {
    def.def
        .iter()
        .map(|bytes| pb::Op::decode(bytes.as_slice()).unwrap())
        .collect()
}

fn exec_ops(ops: &[pb::Op]) -> Vec<pb::ExecOp> {
    ops.iter()
        .filter_map(|op| match &op.op {
            Some(pb::op::Op::Exec(exec)) => Some(exec.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn single_run_produces_source_exec_and_terminal() {
    let base = image("alpine:3.19", ImageOptions::default(), Origin::new("build.lua", 1)).unwrap();
    let result = run(
        &base,
        vec!["echo".to_string(), "hi".to_string()],
        RunOptions::default(),
        Origin::new("build.lua", 2),
    )
    .unwrap();

    let opts = SerializeOptions {
        source_files: vec![(
            "build.lua".to_string(),
            b"local b = bk.image(\"alpine:3.19\")\nbk.export(b:run(\"echo hi\"))\n".to_vec(),
        )],
        ..Default::default()
    };
    let def = serialize(&result, opts).await.unwrap();
    let ops = decode_ops(&def);
    assert!(ops.len() >= 3);

    // Source identifier is the normalized reference.
    let source = ops
        .iter()
        .find_map(|op| match &op.op {
            Some(pb::op::Op::Source(src)) => Some(src.clone()),
            _ => None,
        })
        .unwrap();
    assert_eq!(source.identifier, "docker-image://docker.io/library/alpine:3.19");

    // The exec carries the command and the mandatory rootfs mount.
    let execs = exec_ops(&ops);
    assert_eq!(execs.len(), 1);
    assert_eq!(execs[0].meta.as_ref().unwrap().args, vec!["echo", "hi"]);
    let rootfs = &execs[0].mounts[0];
    assert_eq!(rootfs.dest, "/");
    assert_eq!(rootfs.input, 0);
    assert_eq!(rootfs.mount_type, pb::MountType::Bind as i32);

    // Terminal vertex last, pointing at the exported state.
    let terminal = ops.last().unwrap();
    assert!(terminal.op.is_none());
    assert_eq!(terminal.inputs[0].digest, result.node().digest());

    // Source map: one file, locations at the authoring lines.
    let source_map = def.source.unwrap();
    assert_eq!(source_map.infos.len(), 1);
    let base_loc = &source_map.locations[&base.node().digest()];
    assert_eq!(base_loc.locations[0].ranges[0].start.as_ref().unwrap().line, 1);
    let exec_loc = &source_map.locations[&result.node().digest()];
    assert_eq!(exec_loc.locations[0].ranges[0].start.as_ref().unwrap().line, 2);
}

#[tokio::test]
async fn merge_of_two_runs_keeps_input_order() {
    let base = image("alpine:3.19", ImageOptions::default(), Origin::default()).unwrap();
    let a = run(&base, vec!["echo".to_string(), "a".to_string()], RunOptions::default(), Origin::default()).unwrap();
    let c = run(&base, vec!["echo".to_string(), "c".to_string()], RunOptions::default(), Origin::default()).unwrap();
    let merged = merge(&[a.clone(), c.clone()], Origin::default()).unwrap();

    let def = serialize(&merged, SerializeOptions::default()).await.unwrap();
    let ops = decode_ops(&def);

    let sources = ops
        .iter()
        .filter(|op| matches!(op.op, Some(pb::op::Op::Source(_))))
        .count();
    assert_eq!(sources, 1);
    assert_eq!(exec_ops(&ops).len(), 2);

    let merge_op = ops
        .iter()
        .find(|op| matches!(op.op, Some(pb::op::Op::Merge(_))))
        .unwrap();
    assert_eq!(merge_op.inputs.len(), 2);
    assert_eq!(merge_op.inputs[0].digest, a.node().digest());
    assert_eq!(merge_op.inputs[1].digest, c.node().digest());

    assert!(ops.last().unwrap().op.is_none());
    assert_eq!(ops.len(), 5);
}

#[tokio::test]
async fn config_env_and_workdir_shape_the_exec() {
    let config = ImageConfig {
        config: Some(ImageSettings {
            env: vec!["PATH=/bin".to_string(), "FOO=1".to_string()],
            working_dir: "/app".to_string(),
            ..Default::default()
        }),
        ..Default::default()
    };
    let base = image("alpine:3.19", ImageOptions::default(), Origin::default()).unwrap();
    base.node().set_image_config(config);

    let opts = RunOptions {
        env: vec!["FOO=2".to_string(), "BAR=3".to_string()],
        ..Default::default()
    };
    let result = run(&base, vec!["ls".to_string()], opts, Origin::default()).unwrap();
    let def = serialize(&result, SerializeOptions::default()).await.unwrap();

    let execs = exec_ops(&decode_ops(&def));
    let meta = execs[0].meta.as_ref().unwrap();
    assert_eq!(meta.cwd, "/app");
    assert_eq!(meta.env, vec!["PATH=/bin", "FOO=2", "BAR=3"]);
}

#[tokio::test]
async fn equivalent_graphs_share_digests() {
    let build = || {
        let base = image("alpine:3.19", ImageOptions::default(), Origin::new("build.lua", 1))
            .unwrap();
        run(
            &base,
            vec!["echo".to_string(), "hi".to_string()],
            RunOptions::default(),
            Origin::new("build.lua", 2),
        )
        .unwrap()
    };
    let first = build();
    let second = build();
    luakit_llb::finalize_digests(&first);
    luakit_llb::finalize_digests(&second);
    assert_eq!(first.node().digest(), second.node().digest());
}

#[tokio::test]
async fn distinct_serializations_of_one_root_are_byte_identical() {
    let base = image("debian:12", ImageOptions::default(), Origin::new("build.lua", 1)).unwrap();
    let result = run(
        &base,
        vec!["apt-get".to_string(), "update".to_string()],
        RunOptions::default(),
        Origin::new("build.lua", 3),
    )
    .unwrap();
    let opts = || SerializeOptions {
        source_files: vec![("build.lua".to_string(), b"-- build".to_vec())],
        ..Default::default()
    };
    let first = serialize(&result, opts()).await.unwrap().encode_to_vec();
    let second = serialize(&result, opts()).await.unwrap().encode_to_vec();
    assert_eq!(first, second);
}
