//! Step registry and requirement manifests.
//!
//! Steps are registered explicitly, once, at startup. Each registration
//! carries a [`StepManifest`] declaring the step's parameters, which of them
//! name assets, and whether the step may start a run. The orchestrator never
//! inspects step code; it resolves a [`StepKey`] and reads the manifest.
//!
//! ## Example
//!
//! ```rust
//! use serde_json::json;
//! use workcell_flow::registry::{StepDefinition, StepRegistry};
//!
//! # fn main() -> workcell_flow::error::Result<()> {
//! let mut registry = StepRegistry::new();
//! registry.register(
//!     StepDefinition::builder("transfer", "1")
//!         .top_level()
//!         .asset("pipette", "pipette")
//!         .param("volume", true)
//!         .run(|_ctx, args| async move { Ok(json!({ "moved": args["volume"] })) }),
//! )?;
//! assert_eq!(registry.len(), 1);
//! # Ok(())
//! # }
//! ```

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use ulid::Ulid;

use crate::context::CallContext;
use crate::error::{Error, Result};
use crate::scheduler::ResourceRequirement;

/// Identity of a step: name plus version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StepKey {
    /// Step name.
    pub name: String,
    /// Step version.
    pub version: String,
}

impl StepKey {
    /// Creates a step key.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

impl FromStr for StepKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once('@') {
            Some((name, version)) if !name.is_empty() && !version.is_empty() => {
                Ok(Self::new(name, version))
            }
            _ => Err(Error::InvalidInput(format!(
                "step key '{s}' must look like name@version"
            ))),
        }
    }
}

/// What a declared parameter carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ParamKind {
    /// A plain input value.
    Value {
        /// Whether the argument must be supplied.
        required: bool,
    },
    /// The name of an asset the step needs exclusive use of.
    Asset {
        /// Asset kind the named asset must have.
        asset_type: String,
        /// Capabilities the asset must advertise.
        #[serde(default)]
        capabilities: Vec<String>,
        /// Asset used when the argument is omitted.
        #[serde(default)]
        default_asset: Option<String>,
    },
}

/// One declared parameter of a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParamDescriptor {
    /// Parameter name, as used in the argument object.
    pub name: String,
    /// What the parameter carries.
    #[serde(flatten)]
    pub kind: ParamKind,
}

/// Statically declared metadata for a step registration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepManifest {
    /// Whether the step may be submitted as a run.
    pub top_level: bool,
    /// Name under which the step reads the run's shared state, if any.
    pub state_param: Option<String>,
    /// Declared parameters.
    pub params: Vec<ParamDescriptor>,
    /// Expected run duration, used for schedule estimates.
    pub estimated_duration: Option<Duration>,
}

impl StepManifest {
    /// Checks that every required parameter is present in `args`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] naming the first missing parameter.
    pub fn validate_args(&self, args: &Value) -> Result<()> {
        let empty = Map::new();
        let object = match args {
            Value::Object(map) => map,
            Value::Null => &empty,
            other => {
                return Err(Error::InvalidInput(format!(
                    "step arguments must be an object, got {other}"
                )));
            }
        };
        for param in &self.params {
            let present = object.get(&param.name).is_some_and(|v| !v.is_null());
            let required = match &param.kind {
                ParamKind::Value { required } => *required,
                ParamKind::Asset { default_asset, .. } => default_asset.is_none(),
            };
            if required && !present {
                return Err(Error::InvalidInput(format!(
                    "missing required parameter '{}'",
                    param.name
                )));
            }
        }
        Ok(())
    }

    /// Resolves asset parameters against `inputs`.
    ///
    /// Returns the resource requirements and the parameter-to-asset mapping.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] when an asset argument is missing or
    /// is not a string.
    pub fn resolve_assets(
        &self,
        inputs: &Map<String, Value>,
    ) -> Result<(Vec<ResourceRequirement>, BTreeMap<String, String>)> {
        let mut requirements: Vec<ResourceRequirement> = Vec::new();
        let mut assignments = BTreeMap::new();

        for param in &self.params {
            let ParamKind::Asset {
                asset_type,
                capabilities,
                default_asset,
            } = &param.kind
            else {
                continue;
            };

            let asset_name = match inputs.get(&param.name) {
                Some(Value::String(name)) => name.clone(),
                Some(Value::Null) | None => default_asset.clone().ok_or_else(|| {
                    Error::InvalidInput(format!("missing asset parameter '{}'", param.name))
                })?,
                Some(other) => {
                    return Err(Error::InvalidInput(format!(
                        "asset parameter '{}' must name an asset, got {other}",
                        param.name
                    )));
                }
            };

            assignments.insert(param.name.clone(), asset_name.clone());
            // Two parameters naming one asset share a single reservation.
            if let Some(existing) = requirements.iter_mut().find(|r| r.asset_name == asset_name) {
                for capability in capabilities {
                    if !existing.capabilities.contains(capability) {
                        existing.capabilities.push(capability.clone());
                    }
                }
                continue;
            }
            requirements.push(ResourceRequirement {
                param: param.name.clone(),
                asset_type: asset_type.clone(),
                asset_name,
                capabilities: capabilities.clone(),
            });
        }

        Ok((requirements, assignments))
    }
}

/// An asynchronous step body.
///
/// Runs inline on the run's task. Nested steps are invoked through
/// [`CallContext::call`].
#[async_trait]
pub trait Step: Send + Sync {
    /// Executes the step.
    async fn run(&self, ctx: &CallContext, args: Value) -> Result<Value>;
}

/// A blocking step body, executed on the blocking thread pool.
pub type BlockingStepFn = dyn Fn(&CallContext, Value) -> Result<Value> + Send + Sync;

/// Runnable code behind a registration.
#[derive(Clone)]
pub enum StepBody {
    /// Runs inline on the run's task.
    Async(Arc<dyn Step>),
    /// Off-loaded so the run's control loop is never blocked.
    Blocking(Arc<BlockingStepFn>),
}

impl fmt::Debug for StepBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Async(_) => f.write_str("StepBody::Async"),
            Self::Blocking(_) => f.write_str("StepBody::Blocking"),
        }
    }
}

struct FnStep<F>(F);

#[async_trait]
impl<F, Fut> Step for FnStep<F>
where
    F: Fn(CallContext, Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn run(&self, ctx: &CallContext, args: Value) -> Result<Value> {
        (self.0)(ctx.clone(), args).await
    }
}

/// A step registration: identity, manifest and body.
#[derive(Debug, Clone)]
pub struct StepDefinition {
    /// Step identity.
    pub key: StepKey,
    /// Declared metadata.
    pub manifest: StepManifest,
    /// Runnable code.
    pub body: StepBody,
}

impl StepDefinition {
    /// Starts building a definition.
    #[must_use]
    pub fn builder(name: impl Into<String>, version: impl Into<String>) -> StepDefinitionBuilder {
        StepDefinitionBuilder {
            key: StepKey::new(name, version),
            manifest: StepManifest::default(),
        }
    }
}

/// Builder for [`StepDefinition`].
#[derive(Debug, Clone)]
#[must_use]
pub struct StepDefinitionBuilder {
    key: StepKey,
    manifest: StepManifest,
}

impl StepDefinitionBuilder {
    /// Marks the step as submittable as a run.
    pub fn top_level(mut self) -> Self {
        self.manifest.top_level = true;
        self
    }

    /// Declares the name under which the step reads shared state.
    pub fn state_param(mut self, name: impl Into<String>) -> Self {
        self.manifest.state_param = Some(name.into());
        self
    }

    /// Declares a plain parameter.
    pub fn param(mut self, name: impl Into<String>, required: bool) -> Self {
        self.manifest.params.push(ParamDescriptor {
            name: name.into(),
            kind: ParamKind::Value { required },
        });
        self
    }

    /// Declares an asset parameter of the given kind.
    pub fn asset(self, param: impl Into<String>, asset_type: impl Into<String>) -> Self {
        self.asset_with_capabilities(param, asset_type, Vec::<String>::new())
    }

    /// Declares an asset parameter that needs specific capabilities.
    pub fn asset_with_capabilities(
        mut self,
        param: impl Into<String>,
        asset_type: impl Into<String>,
        capabilities: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.manifest.params.push(ParamDescriptor {
            name: param.into(),
            kind: ParamKind::Asset {
                asset_type: asset_type.into(),
                capabilities: capabilities.into_iter().map(Into::into).collect(),
                default_asset: None,
            },
        });
        self
    }

    /// Sets the asset used when the most recently declared asset parameter
    /// is omitted.
    pub fn default_asset(mut self, asset: impl Into<String>) -> Self {
        if let Some(ParamDescriptor {
            kind: ParamKind::Asset { default_asset, .. },
            ..
        }) = self
            .manifest
            .params
            .iter_mut()
            .rev()
            .find(|p| matches!(p.kind, ParamKind::Asset { .. }))
        {
            *default_asset = Some(asset.into());
        }
        self
    }

    /// Declares how long the step is expected to run.
    pub fn estimated_duration(mut self, duration: Duration) -> Self {
        self.manifest.estimated_duration = Some(duration);
        self
    }

    /// Finishes with an async closure as the body.
    pub fn run<F, Fut>(self, body: F) -> StepDefinition
    where
        F: Fn(CallContext, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.with_step(Arc::new(FnStep(body)))
    }

    /// Finishes with a blocking closure as the body.
    pub fn run_blocking<F>(self, body: F) -> StepDefinition
    where
        F: Fn(&CallContext, Value) -> Result<Value> + Send + Sync + 'static,
    {
        StepDefinition {
            key: self.key,
            manifest: self.manifest,
            body: StepBody::Blocking(Arc::new(body)),
        }
    }

    /// Finishes with a [`Step`] implementation as the body.
    pub fn with_step(self, step: Arc<dyn Step>) -> StepDefinition {
        StepDefinition {
            key: self.key,
            manifest: self.manifest,
            body: StepBody::Async(step),
        }
    }
}

/// A definition plus the identity the registry assigned to it.
#[derive(Debug)]
pub struct RegisteredStep {
    /// Identity assigned at registration.
    pub definition_id: String,
    /// The registered definition.
    pub definition: StepDefinition,
}

/// Mapping from step identity to runnable code and metadata.
///
/// Built once at startup and shared read-only with the orchestrator.
#[derive(Debug, Default)]
pub struct StepRegistry {
    steps: HashMap<StepKey, Arc<RegisteredStep>>,
}

impl StepRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a definition and returns its assigned definition ID.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] if the key is already registered.
    pub fn register(&mut self, definition: StepDefinition) -> Result<String> {
        if self.steps.contains_key(&definition.key) {
            return Err(Error::InvalidInput(format!(
                "step {} is already registered",
                definition.key
            )));
        }
        let definition_id = format!("def_{}", Ulid::new());
        tracing::debug!(step = %definition.key, %definition_id, "registered step");
        self.steps.insert(
            definition.key.clone(),
            Arc::new(RegisteredStep {
                definition_id: definition_id.clone(),
                definition,
            }),
        );
        Ok(definition_id)
    }

    /// Looks up a registration.
    #[must_use]
    pub fn resolve(&self, key: &StepKey) -> Option<Arc<RegisteredStep>> {
        self.steps.get(key).cloned()
    }

    /// Looks up a registration that may start a run.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DefinitionNotFound`] if the key is unknown or the
    /// step is not declared top-level.
    pub fn resolve_top_level(&self, key: &StepKey) -> Result<Arc<RegisteredStep>> {
        self.resolve(key)
            .filter(|step| step.definition.manifest.top_level)
            .ok_or_else(|| Error::DefinitionNotFound {
                definition: key.to_string(),
            })
    }

    /// Returns the number of registrations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}
