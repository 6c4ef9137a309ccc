//! Exec operation construction: command, mounts and config inheritance.

use crate::error::{ValidationError, ValidationResult};
use crate::graph::{NodeMeta, OpNode, Origin, State};
use crate::oci::Platform;
use crate::pb;

/// Network namespace of an exec sandbox. Unknown names map to the
/// default sandbox network.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum NetworkMode {
    #[default]
    Unset,
    Host,
    None,
}

impl NetworkMode {
    pub fn parse(name: &str) -> Self {
        match name {
            "host" => Self::Host,
            "none" => Self::None,
            _ => Self::Unset,
        }
    }

    fn to_pb(self) -> pb::NetMode {
        match self {
            Self::Unset => pb::NetMode::Unset,
            Self::Host => pb::NetMode::Host,
            Self::None => pb::NetMode::None,
        }
    }
}

/// Security mode of an exec sandbox. Unknown names map to sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SecurityMode {
    #[default]
    Sandbox,
    Insecure,
}

impl SecurityMode {
    pub fn parse(name: &str) -> Self {
        match name {
            "insecure" => Self::Insecure,
            _ => Self::Sandbox,
        }
    }

    fn to_pb(self) -> pb::SecurityMode {
        match self {
            Self::Sandbox => pb::SecurityMode::Sandbox,
            Self::Insecure => pb::SecurityMode::Insecure,
        }
    }
}

/// Sharing discipline of a cache mount.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CacheSharing {
    #[default]
    Shared,
    Private,
    Locked,
}

impl CacheSharing {
    pub fn parse(name: &str) -> Self {
        match name {
            "private" => Self::Private,
            "locked" => Self::Locked,
            _ => Self::Shared,
        }
    }

    fn to_pb(self) -> pb::CacheSharingOpt {
        match self {
            Self::Shared => pb::CacheSharingOpt::Shared,
            Self::Private => pb::CacheSharingOpt::Private,
            Self::Locked => pb::CacheSharingOpt::Locked,
        }
    }
}

/// An execution-time attachment. Bind mounts consume an input edge; the
/// other kinds are materialized by the worker and carry no input.
#[derive(Clone)]
pub enum MountSpec {
    Bind {
        state: State,
        dest: String,
        readonly: bool,
        selector: Option<String>,
    },
    Cache {
        dest: String,
        id: String,
        sharing: CacheSharing,
    },
    Tmpfs {
        dest: String,
        size: i64,
    },
    Secret {
        dest: String,
        id: String,
        uid: u32,
        gid: u32,
        mode: u32,
        optional: bool,
    },
    Ssh {
        dest: String,
        id: String,
        uid: u32,
        gid: u32,
        mode: u32,
        optional: bool,
    },
}

impl MountSpec {
    /// Read-only bind of `state` at `dest`.
    pub fn bind(state: State, dest: impl Into<String>) -> Self {
        Self::Bind {
            state,
            dest: dest.into(),
            readonly: true,
            selector: None,
        }
    }

    fn is_rootfs(&self) -> bool {
        matches!(self, Self::Bind { dest, .. } if dest == "/")
    }
}

/// Options for [`run`].
#[derive(Clone, Default)]
pub struct RunOptions {
    /// Extra environment entries; an entry without '=' unsets the
    /// inherited key of that name.
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub mounts: Vec<MountSpec>,
    pub network: NetworkMode,
    pub security: SecurityMode,
    pub hostname: Option<String>,
    /// Extra exit codes treated as success.
    pub valid_exit_codes: Vec<i32>,
    /// `host -> ip` entries added to /etc/hosts.
    pub extra_hosts: Vec<(String, String)>,
    /// Progress description shown while the step runs.
    pub name: Option<String>,
    /// Progress-group id shared with related steps.
    pub progress_group: Option<String>,
}

/// Merge image-config environment with user-supplied entries.
///
/// Image entries come first in their original order; a user entry with a
/// matching key overrides the value in place; user entries without '='
/// unset the key; remaining user entries are appended in user order.
pub fn merge_env(image: &[String], user: &[String]) -> Vec<String> {
    fn key(entry: &str) -> &str {
        entry.split_once('=').map(|(k, _)| k).unwrap_or(entry)
    }

    let mut out = Vec::with_capacity(image.len() + user.len());
    let mut consumed = vec![false; user.len()];
    for entry in image {
        let k = key(entry);
        let mut replacement: Option<Option<&String>> = None;
        for (i, user_entry) in user.iter().enumerate() {
            if key(user_entry) == k {
                consumed[i] = true;
                replacement = Some(user_entry.contains('=').then_some(user_entry));
            }
        }
        match replacement {
            // Unset: drop the key entirely.
            Some(None) => {}
            Some(Some(user_entry)) => out.push(user_entry.clone()),
            None => out.push(entry.clone()),
        }
    }
    for (i, user_entry) in user.iter().enumerate() {
        if !consumed[i] && user_entry.contains('=') {
            out.push(user_entry.clone());
        }
    }
    out
}

fn bind_mount(input: i64, dest: &str, output: i64, readonly: bool, selector: Option<&str>) -> pb::Mount {
    pb::Mount {
        input,
        selector: selector.unwrap_or_default().to_string(),
        dest: dest.to_string(),
        output,
        readonly,
        mount_type: pb::MountType::Bind as i32,
        ..Default::default()
    }
}

/// Run a command on top of `parent`.
///
/// Every exec carries a bind mount at `/` wired to input 0: either the
/// first caller-supplied `/` bind (whose state then replaces the parent
/// as the rootfs) or a synthesized one from `parent`. Further bind
/// mounts consume input indices 1, 2, ... in caller order.
pub fn run(parent: &State, args: Vec<String>, opts: RunOptions, origin: Origin) -> ValidationResult<State> {
    if args.is_empty() || args.iter().all(String::is_empty) {
        return Err(ValidationError::EmptyCommand);
    }

    let rootfs_pos = opts.mounts.iter().position(MountSpec::is_rootfs);
    let (rootfs_state, rootfs_readonly, rootfs_selector) = match rootfs_pos {
        Some(pos) => match &opts.mounts[pos] {
            MountSpec::Bind {
                state,
                readonly,
                selector,
                ..
            } => (state.clone(), *readonly, selector.clone()),
            _ => unreachable!(),
        },
        None => (parent.clone(), false, None),
    };

    // Environment and working directory inherit from the parent state's
    // image config when one is already attached; configs resolved later
    // are applied by the serializer with the same merge rule.
    let config = parent.image_config().cloned();
    let env = match &config {
        Some(config) if !config.env().is_empty() => merge_env(config.env(), &opts.env),
        _ => opts.env.clone(),
    };
    let cwd = match (&opts.cwd, &config) {
        (Some(cwd), _) => cwd.clone(),
        (None, Some(config)) => {
            let wd = config.working_dir();
            if wd.is_empty() { "/" } else { wd }.to_string()
        }
        // Left empty for the serializer's propagation pass to fill.
        (None, None) => String::new(),
    };

    let mut mounts = vec![bind_mount(
        0,
        "/",
        0,
        rootfs_readonly,
        rootfs_selector.as_deref(),
    )];
    let mut bind_states: Vec<State> = vec![rootfs_state];
    for (pos, spec) in opts.mounts.iter().enumerate() {
        if rootfs_pos == Some(pos) {
            continue;
        }
        match spec {
            MountSpec::Bind {
                state,
                dest,
                readonly,
                selector,
            } => {
                let input = bind_states.len() as i64;
                mounts.push(bind_mount(input, dest, -1, *readonly, selector.as_deref()));
                bind_states.push(state.clone());
            }
            MountSpec::Cache { dest, id, sharing } => mounts.push(pb::Mount {
                input: -1,
                dest: dest.clone(),
                output: -1,
                mount_type: pb::MountType::Cache as i32,
                cache_opt: Some(pb::CacheOpt {
                    id: id.clone(),
                    sharing: sharing.to_pb() as i32,
                }),
                ..Default::default()
            }),
            MountSpec::Tmpfs { dest, size } => mounts.push(pb::Mount {
                input: -1,
                dest: dest.clone(),
                output: -1,
                mount_type: pb::MountType::Tmpfs as i32,
                tmpfs_opt: Some(pb::TmpfsOpt { size: *size }),
                ..Default::default()
            }),
            MountSpec::Secret {
                dest,
                id,
                uid,
                gid,
                mode,
                optional,
            } => mounts.push(pb::Mount {
                input: -1,
                dest: dest.clone(),
                output: -1,
                mount_type: pb::MountType::Secret as i32,
                secret_opt: Some(pb::SecretOpt {
                    id: id.clone(),
                    uid: *uid,
                    gid: *gid,
                    mode: *mode,
                    optional: *optional,
                }),
                ..Default::default()
            }),
            MountSpec::Ssh {
                dest,
                id,
                uid,
                gid,
                mode,
                optional,
            } => mounts.push(pb::Mount {
                input: -1,
                dest: dest.clone(),
                output: -1,
                mount_type: pb::MountType::Ssh as i32,
                ssh_opt: Some(pb::SshOpt {
                    id: id.clone(),
                    uid: *uid,
                    gid: *gid,
                    mode: *mode,
                    optional: *optional,
                }),
                ..Default::default()
            }),
        }
    }

    let meta = pb::Meta {
        args,
        env,
        cwd,
        user: opts.user.clone().unwrap_or_default(),
        hostname: opts.hostname.clone().unwrap_or_default(),
        extra_hosts: opts
            .extra_hosts
            .iter()
            .map(|(host, ip)| pb::HostIp {
                host: host.clone(),
                ip: ip.clone(),
            })
            .collect(),
        valid_exit_codes: opts.valid_exit_codes.clone(),
        ..Default::default()
    };

    let platform = parent.platform().cloned();
    let op = pb::Op {
        op: Some(pb::op::Op::Exec(pb::ExecOp {
            meta: Some(meta),
            mounts,
            network: opts.network.to_pb() as i32,
            security: opts.security.to_pb() as i32,
            secretenv: Vec::new(),
        })),
        platform: platform.as_ref().map(Platform::to_pb),
        ..Default::default()
    };

    let node = OpNode::new(
        op,
        NodeMeta {
            origin,
            description: opts.name.clone(),
            progress_group: opts.progress_group.clone(),
            platform: platform.clone(),
            ..Default::default()
        },
    );
    for state in &bind_states {
        node.add_edge(state.node(), state.output());
    }

    let mut result = State::new(node);
    if let Some(platform) = platform {
        result = result.with_platform(platform);
    }
    if let Some(config) = config {
        result = result.with_image_config((*config).clone());
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oci::{ImageConfig, ImageSettings};
    use crate::source::{image, scratch, ImageOptions};

    fn exec_op(state: &State) -> pb::ExecOp {
        match state.node().op_snapshot().op {
            Some(pb::op::Op::Exec(exec)) => exec,
            _ => panic!("not an exec op"),
        }
    }

    fn base() -> State {
        image("alpine:3.19", ImageOptions::default(), Origin::default()).unwrap()
    }

    fn config(env: &[&str], working_dir: &str) -> ImageConfig {
        ImageConfig {
            config: Some(ImageSettings {
                env: env.iter().map(|s| s.to_string()).collect(),
                working_dir: working_dir.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn run_synthesizes_the_rootfs_mount() {
        let state = run(
            &base(),
            vec!["echo".to_string(), "hi".to_string()],
            RunOptions::default(),
            Origin::default(),
        )
        .unwrap();
        let exec = exec_op(&state);
        assert_eq!(exec.mounts[0].dest, "/");
        assert_eq!(exec.mounts[0].input, 0);
        assert_eq!(exec.mounts[0].output, 0);
        assert_eq!(exec.mounts[0].mount_type, pb::MountType::Bind as i32);
        assert_eq!(state.node().edges().len(), 1);
    }

    #[test]
    fn run_rejects_empty_command() {
        assert_eq!(
            run(&base(), vec![], RunOptions::default(), Origin::default()).unwrap_err(),
            ValidationError::EmptyCommand
        );
        assert_eq!(
            run(
                &base(),
                vec![String::new()],
                RunOptions::default(),
                Origin::default()
            )
            .unwrap_err(),
            ValidationError::EmptyCommand
        );
    }

    #[test]
    fn bind_mounts_consume_successive_inputs() {
        let extra = scratch(Origin::default());
        let cachedir = MountSpec::Cache {
            dest: "/root/.cache".to_string(),
            id: "buildcache".to_string(),
            sharing: CacheSharing::Shared,
        };
        let opts = RunOptions {
            mounts: vec![
                cachedir,
                MountSpec::bind(extra.clone(), "/deps"),
                MountSpec::Bind {
                    state: extra,
                    dest: "/out".to_string(),
                    readonly: false,
                    selector: Some("sub".to_string()),
                },
            ],
            ..Default::default()
        };
        let state = run(&base(), vec!["make".to_string()], opts, Origin::default()).unwrap();
        let exec = exec_op(&state);

        // Rootfs first, then user mounts in caller order.
        assert_eq!(exec.mounts[0].dest, "/");
        assert_eq!(exec.mounts[1].mount_type, pb::MountType::Cache as i32);
        assert_eq!(exec.mounts[1].input, -1);
        assert_eq!(exec.mounts[2].dest, "/deps");
        assert_eq!(exec.mounts[2].input, 1);
        assert!(exec.mounts[2].readonly);
        assert_eq!(exec.mounts[3].dest, "/out");
        assert_eq!(exec.mounts[3].input, 2);
        assert_eq!(exec.mounts[3].selector, "sub");
        assert_eq!(state.node().edges().len(), 3);
    }

    #[test]
    fn caller_supplied_root_bind_replaces_the_rootfs() {
        let other = scratch(Origin::default());
        let opts = RunOptions {
            mounts: vec![MountSpec::Bind {
                state: other.clone(),
                dest: "/".to_string(),
                readonly: false,
                selector: None,
            }],
            ..Default::default()
        };
        let state = run(&base(), vec!["true".to_string()], opts, Origin::default()).unwrap();
        let exec = exec_op(&state);
        assert_eq!(exec.mounts.len(), 1);
        assert_eq!(exec.mounts[0].dest, "/");
        // Input 0 is now the supplied state, not the parent.
        let edges = state.node().edges();
        assert_eq!(edges.len(), 1);
        assert!(std::sync::Arc::ptr_eq(
            &edges[0].as_ref().unwrap().node,
            other.node()
        ));
    }

    #[test]
    fn parent_config_fills_env_and_cwd() {
        let parent = base().with_image_config(config(&["PATH=/bin", "FOO=1"], "/app"));
        let opts = RunOptions {
            env: vec!["FOO=2".to_string(), "BAR=3".to_string()],
            ..Default::default()
        };
        let state = run(&parent, vec!["ls".to_string()], opts, Origin::default()).unwrap();
        let meta = exec_op(&state).meta.unwrap();
        assert_eq!(meta.cwd, "/app");
        assert_eq!(meta.env, vec!["PATH=/bin", "FOO=2", "BAR=3"]);
    }

    #[test]
    fn cwd_left_empty_without_config_for_late_propagation() {
        let state = run(
            &base(),
            vec!["ls".to_string()],
            RunOptions::default(),
            Origin::default(),
        )
        .unwrap();
        assert_eq!(exec_op(&state).meta.unwrap().cwd, "");
    }

    #[test]
    fn explicit_cwd_wins_over_config() {
        let parent = base().with_image_config(config(&[], "/app"));
        let opts = RunOptions {
            cwd: Some("/work".to_string()),
            ..Default::default()
        };
        let state = run(&parent, vec!["ls".to_string()], opts, Origin::default()).unwrap();
        assert_eq!(exec_op(&state).meta.unwrap().cwd, "/work");
    }

    #[test]
    fn merge_env_override_unset_and_append() {
        let image = vec![
            "PATH=/bin".to_string(),
            "FOO=1".to_string(),
            "DROP=yes".to_string(),
        ];
        let user = vec!["FOO=2".to_string(), "DROP".to_string(), "BAR=3".to_string()];
        assert_eq!(
            merge_env(&image, &user),
            vec!["PATH=/bin", "FOO=2", "BAR=3"]
        );
    }

    #[test]
    fn merge_env_is_idempotent() {
        let image = vec!["PATH=/bin".to_string(), "FOO=1".to_string()];
        let user = vec!["FOO=2".to_string(), "BAR=3".to_string()];
        let once = merge_env(&image, &user);
        let twice = merge_env(&image, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn run_records_modes_and_exit_codes() {
        let opts = RunOptions {
            network: NetworkMode::parse("host"),
            security: SecurityMode::parse("insecure"),
            hostname: Some("builder".to_string()),
            valid_exit_codes: vec![0, 3],
            user: Some("nobody".to_string()),
            ..Default::default()
        };
        let state = run(&base(), vec!["id".to_string()], opts, Origin::default()).unwrap();
        let exec = exec_op(&state);
        assert_eq!(exec.network, pb::NetMode::Host as i32);
        assert_eq!(exec.security, pb::SecurityMode::Insecure as i32);
        let meta = exec.meta.unwrap();
        assert_eq!(meta.hostname, "builder");
        assert_eq!(meta.user, "nobody");
        assert_eq!(meta.valid_exit_codes, vec![0, 3]);
    }

    #[test]
    fn unknown_mode_names_fall_back_to_defaults() {
        assert_eq!(NetworkMode::parse("bridge"), NetworkMode::Unset);
        assert_eq!(SecurityMode::parse("root"), SecurityMode::Sandbox);
        assert_eq!(CacheSharing::parse("exclusive"), CacheSharing::Shared);
    }
}
