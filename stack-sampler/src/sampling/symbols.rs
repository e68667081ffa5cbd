//! Two-level function name lookup.
//!
//! Layer one is keyed by the fast [`FunctionId`], which is only valid while the
//! runtime stays suspended, so it is cleared at the start of every cycle.
//! Layer two is keyed by the stable [`FunctionIdentifier`] and lives for the
//! whole process. Names are shared (`Arc`) between both layers, so evicting an
//! entry from one layer never invalidates the other.

use crate::sampling::ids::{FrameToken, FunctionId, FunctionIdentifier};
use crate::sampling::name_cache::NameCache;
use crate::sampling::records::SamplingStatistics;
use crate::sampling::runtime::{ManagedRuntime, MethodSignature};
use std::sync::Arc;
use tracing::debug;
use widestring::U16String;

/// A resolved frame name, shared between caches and the current writer.
pub type FrameName = Arc<U16String>;

pub const UNKNOWN_FUNCTION_NAME: &str = "Unknown(unknown)";
pub const UNKNOWN_NATIVE_FUNCTION_NAME: &str = "Unknown_Native_Function(unknown)";
const UNKNOWN_ARGUMENTS: &str = "(unknown)";

const NAME_SEPARATOR: &str = ".";
const PARAMS_SEPARATOR: &str = ", ";

pub struct FunctionNameResolver {
    volatile: NameCache<FunctionId, FrameName>,
    stable: NameCache<FunctionIdentifier, FrameName>,
}

impl FunctionNameResolver {
    pub fn new(stable_capacity: usize, volatile_capacity: usize) -> Self {
        Self {
            volatile: NameCache::new(volatile_capacity),
            stable: NameCache::new(stable_capacity),
        }
    }

    /// Forget all suspension-scoped ids. Call before every capture pass.
    pub fn begin_cycle(&mut self) {
        self.volatile.clear();
    }

    pub fn volatile_len(&self) -> usize {
        self.volatile.len()
    }

    pub fn stable_len(&self) -> usize {
        self.stable.len()
    }

    /// Resolve the name of the function running in one frame.
    ///
    /// Counts a cache miss in `stats` whenever the runtime's metadata has to
    /// be consulted.
    pub fn lookup(
        &mut self,
        runtime: &dyn ManagedRuntime,
        function: FunctionId,
        frame: FrameToken,
        stats: &mut SamplingStatistics,
    ) -> FrameName {
        if let Some(name) = self.volatile.get(&function) {
            return name.clone();
        }

        let identifier = function_identifier(runtime, function, frame);
        if let Some(name) = self.stable.get(&identifier) {
            let name = name.clone();
            self.volatile.put(function, name.clone());
            return name;
        }

        stats.name_cache_misses += 1;
        let name: FrameName = Arc::new(function_name(runtime, &identifier));
        self.stable.put(identifier, name.clone());
        self.volatile.put(function, name.clone());
        name
    }
}

fn function_identifier(
    runtime: &dyn ManagedRuntime,
    function: FunctionId,
    frame: FrameToken,
) -> FunctionIdentifier {
    if function.is_native() {
        return FunctionIdentifier::NATIVE;
    }
    match runtime.function_identifier(function, frame) {
        Ok(identifier) => identifier,
        Err(err) => {
            debug!(target: "stack_sampler::symbols", %err, function = function.as_u64(), "Could not derive function identifier");
            FunctionIdentifier::INVALID
        }
    }
}

fn function_name(runtime: &dyn ManagedRuntime, identifier: &FunctionIdentifier) -> U16String {
    if !identifier.is_valid {
        return U16String::from_str(UNKNOWN_FUNCTION_NAME);
    }
    if identifier.function_token == 0 {
        return U16String::from_str(UNKNOWN_NATIVE_FUNCTION_NAME);
    }
    match runtime.method_signature(identifier) {
        Ok(signature) => format_signature(&signature),
        Err(err) => {
            debug!(
                target: "stack_sampler::symbols",
                %err,
                token = identifier.function_token,
                module = identifier.module_id,
                "Could not read method metadata"
            );
            U16String::from_str(UNKNOWN_FUNCTION_NAME)
        }
    }
}

/// Render `Type.Method[T1, T2](Arg1, Arg2)`.
pub fn format_signature(signature: &MethodSignature) -> U16String {
    let mut name = signature.type_name.clone();
    name.push_str(NAME_SEPARATOR);
    name.push(&signature.method_name);

    if !signature.generic_parameters.is_empty() {
        name.push_str("[");
        push_joined(&mut name, &signature.generic_parameters);
        name.push_str("]");
    }

    match &signature.arguments {
        Some(arguments) => {
            name.push_str("(");
            push_joined(&mut name, arguments);
            name.push_str(")");
        }
        None => name.push_str(UNKNOWN_ARGUMENTS),
    }
    name
}

fn push_joined(out: &mut U16String, parts: &[U16String]) {
    for (i, part) in parts.iter().enumerate() {
        if i != 0 {
            out.push_str(PARAMS_SEPARATOR);
        }
        out.push(part);
    }
}
