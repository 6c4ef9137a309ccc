//! Frontend driver contract, exercised against an in-memory client.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use prost::Message;

use luakit_gateway::{
    run_frontend, FrontendConfig, GatewayClient, GatewayError, SolveReference,
};
use luakit_llb::{pb, BoxError};
use luakit_script::ScriptError;

struct MockClient {
    caps: HashSet<String>,
    files: HashMap<String, Vec<u8>>,
    solved: Mutex<Option<pb::Definition>>,
}

impl MockClient {
    fn new(script: Option<&str>) -> Self {
        let mut files = HashMap::new();
        if let Some(script) = script {
            files.insert("context/build.lua".to_string(), script.as_bytes().to_vec());
        }
        Self {
            caps: HashSet::from(["file.base".to_string()]),
            files,
            solved: Mutex::new(None),
        }
    }

    fn without_caps(mut self) -> Self {
        self.caps.clear();
        self
    }

    fn solved_definition(&self) -> Option<pb::Definition> {
        self.solved.lock().unwrap().clone()
    }
}

#[async_trait]
impl GatewayClient for MockClient {
    fn has_capability(&self, capability: &str) -> bool {
        self.caps.contains(capability)
    }

    async fn read_context_file(
        &self,
        input: &str,
        filename: &str,
    ) -> Result<Vec<u8>, BoxError> {
        self.files
            .get(&format!("{input}/{filename}"))
            .cloned()
            .ok_or_else(|| format!("{filename} not found").into())
    }

    async fn solve(&self, definition: pb::Definition) -> Result<SolveReference, BoxError> {
        *self.solved.lock().unwrap() = Some(definition);
        Ok(SolveReference("ref-1".to_string()))
    }
}

fn decode_ops(def: &pb::Definition) -> Vec<pb::Op> {
    def.def
        .iter()
        .map(|bytes| pb::Op::decode(bytes.as_slice()).unwrap())
        .collect()
}

#[tokio::test]
async fn solves_the_definition_of_the_context_script() {
    let client = MockClient::new(Some(
        "local b = bk.image(\"alpine:3.19\")\nbk.export(b:run(\"echo hi\"))\n",
    ));
    let reference = run_frontend(&client, FrontendConfig::default())
        .await
        .unwrap();
    assert_eq!(reference, SolveReference("ref-1".to_string()));

    let definition = client.solved_definition().unwrap();
    let ops = decode_ops(&definition);
    assert!(ops.len() >= 3);
    assert!(ops.last().unwrap().op.is_none());
}

#[tokio::test]
async fn refuses_to_build_without_the_file_capability() {
    let client = MockClient::new(Some("bk.export(bk.scratch())\n")).without_caps();
    let err = run_frontend(&client, FrontendConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::MissingCapability(cap) if cap == "file.base"));
}

#[tokio::test]
async fn missing_script_surfaces_as_a_context_read_error() {
    let client = MockClient::new(None);
    let err = run_frontend(&client, FrontendConfig::default())
        .await
        .unwrap_err();
    match err {
        GatewayError::ContextRead { input, filename, .. } => {
            assert_eq!(input, "context");
            assert_eq!(filename, "build.lua");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[tokio::test]
async fn syntax_directive_does_not_shift_source_lines() {
    let client = MockClient::new(Some(
        "# syntax=ghcr.io/org/luakit:latest\nlocal b = bk.image(\"alpine\")\nbk.export(b)\n",
    ));
    run_frontend(&client, FrontendConfig::default())
        .await
        .unwrap();

    let definition = client.solved_definition().unwrap();
    let source = definition.source.unwrap();
    let lines: Vec<i32> = source
        .locations
        .values()
        .map(|locs| locs.locations[0].ranges[0].start.as_ref().unwrap().line)
        .collect();
    // The image call sits on line 2 of the original script.
    assert_eq!(lines, vec![2]);
}

#[tokio::test]
async fn custom_filename_is_read_from_the_context() {
    let mut client = MockClient::new(None);
    client.files.insert(
        "context/ci.lua".to_string(),
        b"bk.export(bk.scratch())\n".to_vec(),
    );
    let config = FrontendConfig {
        filename: "ci.lua".to_string(),
        ..Default::default()
    };
    run_frontend(&client, config).await.unwrap();
    assert!(client.solved_definition().is_some());
}

#[tokio::test]
async fn script_without_export_fails_before_solve() {
    let client = MockClient::new(Some("local s = bk.scratch()\n"));
    let err = run_frontend(&client, FrontendConfig::default())
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Script(ScriptError::NoExport)));
    assert!(client.solved_definition().is_none());
}
