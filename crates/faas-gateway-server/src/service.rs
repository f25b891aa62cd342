use dashmap::DashSet;
use faas_common::{CallRequest, FaasError, Function, FunctionResponse, FunctionSpec, Result};
use faas_executor::{BuildPipeline, InvocationEngine};
use faas_store::FunctionRegistry;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Registration, lookup, deletion and invocation of functions.
pub struct FunctionService {
    registry: Arc<dyn FunctionRegistry>,
    builder: BuildPipeline,
    engine: Arc<InvocationEngine>,
    // Names with a registration in flight in this process.
    pending: DashSet<String>,
}

/// Holds a name in the pending set until dropped.
struct PendingName<'a> {
    pending: &'a DashSet<String>,
    name: String,
}

impl<'a> PendingName<'a> {
    fn claim(pending: &'a DashSet<String>, name: &str) -> Option<Self> {
        pending.insert(name.to_string()).then(|| Self {
            pending,
            name: name.to_string(),
        })
    }
}

impl Drop for PendingName<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.name);
    }
}

impl FunctionService {
    pub fn new(
        registry: Arc<dyn FunctionRegistry>,
        builder: BuildPipeline,
        engine: InvocationEngine,
    ) -> Self {
        Self {
            registry,
            builder,
            engine: Arc::new(engine),
            pending: DashSet::new(),
        }
    }

    pub fn engine(&self) -> &InvocationEngine {
        &self.engine
    }

    /// Builds the image, then records the function.
    ///
    /// A name that is registered, or being registered, is rejected before
    /// any build starts. Nothing is recorded when the build fails.
    #[instrument(skip(self, spec), fields(function = %spec.name, memory = spec.memory))]
    pub async fn register(&self, spec: FunctionSpec) -> Result<Function> {
        spec.validate()?;
        let _claim = PendingName::claim(&self.pending, &spec.name)
            .ok_or_else(|| FaasError::DuplicateFunction(spec.name.clone()))?;
        if self.registry.exists(&spec.name).await? {
            return Err(FaasError::DuplicateFunction(spec.name));
        }

        let tag = self.builder.build_function_image(&spec).await?;
        let function = Function::new(spec, tag);

        match self.registry.insert(&function).await {
            Ok(true) => {
                info!(image = %function.image_tag, "Function registered");
                Ok(function)
            }
            // Another process sharing the registry recorded the name first. Its
            // record now points at the image this build overwrote (same tag):
            // last writer wins on the image, first writer on the record.
            Ok(false) => Err(FaasError::DuplicateFunction(function.name)),
            Err(e) => {
                if let Err(cleanup) = self.builder.remove_function_image(&function.image_tag).await {
                    warn!(image = %function.image_tag, error = %cleanup, "Failed to remove orphaned image");
                }
                Err(e.into())
            }
        }
    }

    pub async fn get(&self, name: &str) -> Result<Function> {
        self.registry
            .get_by_name(name)
            .await?
            .ok_or_else(|| FaasError::FunctionNotFound(name.to_string()))
    }

    pub async fn list(&self) -> Result<Vec<Function>> {
        Ok(self.registry.get_all().await?)
    }

    /// Deletes the record, then the image. A failed image removal puts the
    /// record back, so a record never outlives its image.
    #[instrument(skip(self))]
    pub async fn delete(&self, name: &str) -> Result<()> {
        let function = self.get(name).await?;
        if !self.registry.delete(name).await? {
            return Err(FaasError::FunctionNotFound(name.to_string()));
        }

        if let Err(e) = self.builder.remove_function_image(&function.image_tag).await {
            match self.registry.insert(&function).await {
                Ok(true) => info!("Function record restored after failed image removal"),
                Ok(false) => warn!("Name was registered again while its delete was failing"),
                Err(restore) => {
                    error!(image = %function.image_tag, error = %restore, "Failed to restore function record")
                }
            }
            return Err(e);
        }
        info!(image = %function.image_tag, "Function deleted");
        Ok(())
    }

    pub async fn invoke(&self, request: CallRequest) -> Result<FunctionResponse> {
        let function = self.get(&request.function).await?;
        self.engine.invoke_detached(function, request).await
    }
}
