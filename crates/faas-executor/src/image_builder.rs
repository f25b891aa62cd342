use crate::runtime::RuntimeClient;
use crate::RuntimeError;
use bytes::Bytes;
use faas_common::{FaasError, FunctionSpec, Result, TransportKind};
use std::sync::Arc;
use tracing::{info, instrument, warn};

pub const DOCKERFILE: &str = include_str!("../../../dockerfiles/node/Dockerfile");
/// HTTP listener runner, used by the gateway transport.
pub const GATEWAY_RUNNER: &str = include_str!("../../../dockerfiles/node/server.js");
/// One-shot runner, used by the stdio transport.
pub const STDIO_RUNNER: &str = include_str!("../../../dockerfiles/node/server-stdio.js");

const ENTRY_MODE: u32 = 0o600;

/// The files an image is built from, in archive order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildContext {
    entries: Vec<(String, Vec<u8>)>,
}

impl BuildContext {
    /// `Dockerfile`, the transport's runner as `server.js`, then the
    /// function's `package.json` and `code.js`.
    pub fn for_function(transport: TransportKind, code: &str, package: &str) -> Self {
        let runner = match transport {
            TransportKind::Stdio => STDIO_RUNNER,
            TransportKind::Gateway => GATEWAY_RUNNER,
        };
        Self {
            entries: vec![
                ("Dockerfile".to_string(), DOCKERFILE.as_bytes().to_vec()),
                ("server.js".to_string(), runner.as_bytes().to_vec()),
                ("package.json".to_string(), package.as_bytes().to_vec()),
                ("code.js".to_string(), code.as_bytes().to_vec()),
            ],
        }
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .map(|(name, content)| (name.as_str(), content.as_slice()))
    }

    /// Encodes the context as a tar stream, each entry with mode 0600.
    pub fn into_archive(self) -> std::io::Result<Bytes> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in &self.entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(ENTRY_MODE);
            header.set_entry_type(tar::EntryType::Regular);
            builder.append_data(&mut header, name, content.as_slice())?;
        }
        Ok(Bytes::from(builder.into_inner()?))
    }
}

/// Builds function images through a [`RuntimeClient`].
#[derive(Clone)]
pub struct BuildPipeline {
    runtime: Arc<dyn RuntimeClient>,
    transport: TransportKind,
}

impl BuildPipeline {
    pub fn new(runtime: Arc<dyn RuntimeClient>, transport: TransportKind) -> Self {
        Self { runtime, transport }
    }

    /// Images are tagged with the function name.
    pub fn image_tag(name: &str) -> String {
        name.to_string()
    }

    /// Returns the tag of the built image. Nothing is recorded anywhere when
    /// the build fails.
    #[instrument(skip(self, spec), fields(function = %spec.name, transport = %self.transport))]
    pub async fn build_function_image(&self, spec: &FunctionSpec) -> Result<String> {
        let tag = Self::image_tag(&spec.name);
        let archive = BuildContext::for_function(self.transport, &spec.code, &spec.package)
            .into_archive()?;
        info!(%tag, context_bytes = archive.len(), "Building function image");

        self.runtime
            .build_image(&tag, archive)
            .await
            .map_err(|e| FaasError::BuildFailed {
                name: spec.name.clone(),
                message: match e {
                    RuntimeError::BuildFailed(message) => message,
                    other => other.to_string(),
                },
            })?;
        Ok(tag)
    }

    /// Removes the image; an image that is already gone counts as removed.
    pub async fn remove_function_image(&self, tag: &str) -> Result<()> {
        match self.runtime.remove_image(tag).await {
            Ok(()) => Ok(()),
            Err(RuntimeError::NotFound(message)) => {
                warn!(%tag, %message, "Image already absent");
                Ok(())
            }
            Err(e) => Err(FaasError::lifecycle("remove image", e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_archive_has_four_exact_entries() {
        let code = "exports.hello = (req, res) => res.send({ hi: req.query.name })\n";
        let package = r#"{"name":"hello","version":"1.0.0","dependencies":{}}"#;
        let archive = BuildContext::for_function(TransportKind::Stdio, code, package)
            .into_archive()
            .unwrap();

        let mut tar = tar::Archive::new(archive.as_ref());
        let mut seen = Vec::new();
        for entry in tar.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            assert_eq!(entry.header().mode().unwrap(), 0o600, "{name}");
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            assert_eq!(entry.header().size().unwrap(), content.len() as u64);
            seen.push((name, content));
        }

        let names: Vec<&str> = seen.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, ["Dockerfile", "server.js", "package.json", "code.js"]);
        assert_eq!(seen[0].1, DOCKERFILE.as_bytes());
        assert_eq!(seen[1].1, STDIO_RUNNER.as_bytes());
        assert_eq!(seen[2].1, package.as_bytes());
        assert_eq!(seen[3].1, code.as_bytes());
    }

    #[test]
    fn test_gateway_context_ships_listener_runner() {
        let context = BuildContext::for_function(TransportKind::Gateway, "", "{}");
        let (name, runner) = context.entries().nth(1).unwrap();
        assert_eq!(name, "server.js");
        assert_eq!(runner, GATEWAY_RUNNER.as_bytes());
        // Empty sources are still archived as zero-length entries.
        assert_eq!(context.entries().nth(3).unwrap().1.len(), 0);
    }
}
