//! File operation construction: copy, mkdir, mkfile, rm, symlink.
//!
//! A file op is an ordered action sequence over one filesystem. Actions
//! after the first chain on the previous action's virtual output; copy
//! actions additionally consume the source state as a secondary input.

use crate::error::{ValidationError, ValidationResult};
use crate::graph::{NodeMeta, OpNode, Origin, State};
use crate::pb;

/// Identity a file action assigns to created entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserOpt {
    ByName(String),
    ById(u32),
}

impl UserOpt {
    fn to_pb(&self) -> pb::UserOpt {
        let user = match self {
            Self::ByName(name) => pb::user_opt::User::ByName(pb::NamedUserOpt {
                name: name.clone(),
                input: -1,
            }),
            Self::ById(id) => pb::user_opt::User::ById(*id),
        };
        pb::UserOpt { user: Some(user) }
    }
}

/// Ownership override with independent user and group halves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChownOpt {
    pub user: Option<UserOpt>,
    pub group: Option<UserOpt>,
}

impl ChownOpt {
    fn to_pb(&self) -> Option<pb::ChownOpt> {
        if self.user.is_none() && self.group.is_none() {
            return None;
        }
        Some(pb::ChownOpt {
            user: self.user.as_ref().map(UserOpt::to_pb),
            group: self.group.as_ref().map(UserOpt::to_pb),
        })
    }
}

/// Options for [`FileActions::copy`].
#[derive(Debug, Clone)]
pub struct CopyOptions {
    pub follow_symlink: bool,
    pub dir_copy_contents: bool,
    pub create_dest_path: bool,
    pub allow_wildcard: bool,
    pub allow_empty_wildcard: bool,
    pub mode: Option<i32>,
    pub owner: ChownOpt,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
}

impl Default for CopyOptions {
    fn default() -> Self {
        Self {
            follow_symlink: true,
            dir_copy_contents: false,
            create_dest_path: true,
            allow_wildcard: true,
            allow_empty_wildcard: false,
            mode: None,
            owner: ChownOpt::default(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
        }
    }
}

/// Options for [`FileActions::mkdir`].
#[derive(Debug, Clone)]
pub struct MkdirOptions {
    pub mode: i32,
    pub make_parents: bool,
    pub owner: ChownOpt,
}

impl Default for MkdirOptions {
    fn default() -> Self {
        Self {
            mode: 0o755,
            make_parents: false,
            owner: ChownOpt::default(),
        }
    }
}

/// Options for [`FileActions::mkfile`].
#[derive(Debug, Clone)]
pub struct MkfileOptions {
    pub mode: i32,
    pub owner: ChownOpt,
}

impl Default for MkfileOptions {
    fn default() -> Self {
        Self {
            mode: 0o644,
            owner: ChownOpt::default(),
        }
    }
}

/// Options for [`FileActions::rm`].
#[derive(Debug, Clone, Default)]
pub struct RmOptions {
    pub allow_not_found: bool,
    pub allow_wildcard: bool,
}

enum PendingAction {
    Copy {
        from: State,
        src: String,
        dest: String,
        opts: CopyOptions,
    },
    Mkdir {
        path: String,
        opts: MkdirOptions,
    },
    Mkfile {
        path: String,
        data: Vec<u8>,
        opts: MkfileOptions,
    },
    Rm {
        path: String,
        opts: RmOptions,
    },
    Symlink {
        oldpath: String,
        newpath: String,
        owner: ChownOpt,
    },
}

/// Accumulates an ordered action sequence into one file op.
#[derive(Default)]
pub struct FileActions {
    actions: Vec<PendingAction>,
}

impl FileActions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn copy(mut self, from: State, src: &str, dest: &str, opts: CopyOptions) -> ValidationResult<Self> {
        require_path("copy", "src", src)?;
        require_path("copy", "dest", dest)?;
        self.actions.push(PendingAction::Copy {
            from,
            src: src.to_string(),
            dest: dest.to_string(),
            opts,
        });
        Ok(self)
    }

    pub fn mkdir(mut self, path: &str, opts: MkdirOptions) -> ValidationResult<Self> {
        require_path("mkdir", "path", path)?;
        self.actions.push(PendingAction::Mkdir {
            path: path.to_string(),
            opts,
        });
        Ok(self)
    }

    pub fn mkfile(mut self, path: &str, data: Vec<u8>, opts: MkfileOptions) -> ValidationResult<Self> {
        require_path("mkfile", "path", path)?;
        self.actions.push(PendingAction::Mkfile {
            path: path.to_string(),
            data,
            opts,
        });
        Ok(self)
    }

    pub fn rm(mut self, path: &str, opts: RmOptions) -> ValidationResult<Self> {
        require_path("rm", "path", path)?;
        self.actions.push(PendingAction::Rm {
            path: path.to_string(),
            opts,
        });
        Ok(self)
    }

    pub fn symlink(mut self, oldpath: &str, newpath: &str, owner: ChownOpt) -> ValidationResult<Self> {
        require_path("symlink", "oldpath", oldpath)?;
        require_path("symlink", "newpath", newpath)?;
        self.actions.push(PendingAction::Symlink {
            oldpath: oldpath.to_string(),
            newpath: newpath.to_string(),
            owner,
        });
        Ok(self)
    }

    /// Materialize the sequence as one file op rooted at `parent`.
    pub fn build(self, parent: &State, origin: Origin) -> ValidationResult<State> {
        if self.actions.is_empty() {
            return Err(ValidationError::EmptyPath {
                action: "file",
                field: "actions",
            });
        }

        // Input 0 is the filesystem being mutated; each copy source is
        // appended as a further real input. Chained actions read the
        // previous action's output through a virtual index past the real
        // inputs.
        let mut inputs: Vec<State> = vec![parent.clone()];
        let mut actions = Vec::with_capacity(self.actions.len());
        let total = self.actions.len();
        for (i, pending) in self.actions.into_iter().enumerate() {
            let input = if i == 0 {
                0
            } else {
                // total real inputs are only known after the loop; patch
                // below once the count is fixed.
                -(i as i64)
            };
            let output = if i + 1 == total { 0 } else { -1 };
            let (secondary_input, action) = match pending {
                PendingAction::Copy {
                    from,
                    src,
                    dest,
                    opts,
                } => {
                    let secondary = inputs.len() as i64;
                    inputs.push(from);
                    (
                        secondary,
                        pb::file_action::Action::Copy(pb::FileActionCopy {
                            src,
                            dest,
                            owner: opts.owner.to_pb(),
                            mode: opts.mode.unwrap_or(-1),
                            follow_symlink: opts.follow_symlink,
                            dir_copy_contents: opts.dir_copy_contents,
                            create_dest_path: opts.create_dest_path,
                            allow_wildcard: opts.allow_wildcard,
                            allow_empty_wildcard: opts.allow_empty_wildcard,
                            timestamp: -1,
                            include_patterns: opts.include_patterns,
                            exclude_patterns: opts.exclude_patterns,
                            ..Default::default()
                        }),
                    )
                }
                PendingAction::Mkdir { path, opts } => (
                    -1,
                    pb::file_action::Action::Mkdir(pb::FileActionMkDir {
                        path,
                        mode: opts.mode,
                        make_parents: opts.make_parents,
                        owner: opts.owner.to_pb(),
                        timestamp: -1,
                    }),
                ),
                PendingAction::Mkfile { path, data, opts } => (
                    -1,
                    pb::file_action::Action::Mkfile(pb::FileActionMkFile {
                        path,
                        mode: opts.mode,
                        data,
                        owner: opts.owner.to_pb(),
                        timestamp: -1,
                    }),
                ),
                PendingAction::Rm { path, opts } => (
                    -1,
                    pb::file_action::Action::Rm(pb::FileActionRm {
                        path,
                        allow_not_found: opts.allow_not_found,
                        allow_wildcard: opts.allow_wildcard,
                    }),
                ),
                PendingAction::Symlink {
                    oldpath,
                    newpath,
                    owner,
                } => (
                    -1,
                    pb::file_action::Action::Symlink(pb::FileActionSymlink {
                        oldpath,
                        newpath,
                        owner: owner.to_pb(),
                        timestamp: -1,
                    }),
                ),
            };
            actions.push(pb::FileAction {
                input,
                secondary_input,
                output,
                action: Some(action),
            });
        }

        // Fix up chained inputs now that the real input count is known:
        // action i > 0 reads virtual output (inputs + i - 1).
        let real_inputs = inputs.len() as i64;
        for (i, action) in actions.iter_mut().enumerate() {
            if i > 0 {
                action.input = real_inputs + i as i64 - 1;
            }
        }

        let op = pb::Op {
            op: Some(pb::op::Op::File(pb::FileOp { actions })),
            ..Default::default()
        };
        let node = OpNode::new(
            op,
            NodeMeta {
                origin,
                ..Default::default()
            },
        );
        for state in &inputs {
            node.add_edge(state.node(), state.output());
        }
        Ok(State::new(node))
    }
}

fn require_path(action: &'static str, field: &'static str, value: &str) -> ValidationResult<()> {
    if value.is_empty() {
        return Err(ValidationError::EmptyPath { action, field });
    }
    Ok(())
}

/// Copy `src` from `from` onto `parent` at `dest`.
pub fn copy(
    parent: &State,
    from: &State,
    src: &str,
    dest: &str,
    opts: CopyOptions,
    origin: Origin,
) -> ValidationResult<State> {
    FileActions::new()
        .copy(from.clone(), src, dest, opts)?
        .build(parent, origin)
}

/// Create a directory at `path`.
pub fn mkdir(parent: &State, path: &str, opts: MkdirOptions, origin: Origin) -> ValidationResult<State> {
    FileActions::new().mkdir(path, opts)?.build(parent, origin)
}

/// Create a file at `path` with `data`.
pub fn mkfile(
    parent: &State,
    path: &str,
    data: Vec<u8>,
    opts: MkfileOptions,
    origin: Origin,
) -> ValidationResult<State> {
    FileActions::new()
        .mkfile(path, data, opts)?
        .build(parent, origin)
}

/// Remove `path`.
pub fn rm(parent: &State, path: &str, opts: RmOptions, origin: Origin) -> ValidationResult<State> {
    FileActions::new().rm(path, opts)?.build(parent, origin)
}

/// Create a symlink at `newpath` pointing at `oldpath`.
pub fn symlink(
    parent: &State,
    oldpath: &str,
    newpath: &str,
    owner: ChownOpt,
    origin: Origin,
) -> ValidationResult<State> {
    FileActions::new()
        .symlink(oldpath, newpath, owner)?
        .build(parent, origin)
}
