use crate::EngineError;
use std::process::Command;
use tracing::debug;

/// One image build request, handed to the external builder collaborator.
#[derive(Debug, Clone, Default)]
pub struct BuildRequest {
    pub context: String,
    pub dockerfile: Option<String>,
    pub tags: Vec<String>,
    pub no_cache: bool,
    pub pull: bool,
    pub force_rm: bool,
}

/// Image construction seam. Implementations return the reference of the
/// image they produced.
pub trait ImageBuilder: Send + Sync {
    fn build(&self, request: &BuildRequest) -> Result<String, EngineError>;
}

/// Deterministic builder double: derives an image reference from the request
/// without touching any engine.
#[derive(Debug, Default)]
pub struct MockBuilder;

impl MockBuilder {
    pub fn new() -> Self {
        Self
    }
}

impl ImageBuilder for MockBuilder {
    fn build(&self, request: &BuildRequest) -> Result<String, EngineError> {
        if let Some(tag) = request.tags.first() {
            return Ok(tag.clone());
        }
        let digest = blake3::hash(request.context.as_bytes()).to_hex();
        Ok(format!("built-{}", &digest[..12]))
    }
}

/// Builder adapter shelling out to `docker build`.
pub struct DockerCliBuilder {
    binary: String,
}

impl DockerCliBuilder {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl ImageBuilder for DockerCliBuilder {
    fn build(&self, request: &BuildRequest) -> Result<String, EngineError> {
        let mut args = vec!["build".to_owned()];
        for tag in &request.tags {
            args.push("--tag".to_owned());
            args.push(tag.clone());
        }
        if let Some(dockerfile) = &request.dockerfile {
            args.push("--file".to_owned());
            args.push(dockerfile.clone());
        }
        if request.no_cache {
            args.push("--no-cache".to_owned());
        }
        if request.pull {
            args.push("--pull".to_owned());
        }
        if request.force_rm {
            args.push("--force-rm".to_owned());
        }
        args.push(request.context.clone());

        debug!("{} {}", self.binary, args.join(" "));
        let output = Command::new(&self.binary).args(&args).output()?;
        if !output.status.success() {
            return Err(EngineError::Remote(
                String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            ));
        }
        request
            .tags
            .first()
            .cloned()
            .ok_or_else(|| EngineError::Remote("build produced no tagged image".to_owned()))
    }
}

/// Select a builder implementation by engine name.
pub fn select_builder(name: &str) -> Result<Box<dyn ImageBuilder>, EngineError> {
    match name {
        "docker" => Ok(Box::new(DockerCliBuilder::new("docker"))),
        "podman" => Ok(Box::new(DockerCliBuilder::new("podman"))),
        "mock" => Ok(Box::new(MockBuilder::new())),
        other => Err(EngineError::Unavailable(other.to_owned())),
    }
}
