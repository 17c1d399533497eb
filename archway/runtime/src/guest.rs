//! One linked guest instance and the process it owns.

use archway_dagger::{resolve_imports, Process, ProcessHost};
use wasmtime::{
    Engine, Func, Instance, Module, Store, StoreLimits, StoreLimitsBuilder, Val, ValType,
};

use crate::config::RunnerConfig;
use crate::error::{Result, RuntimeError};

/// Data held by a guest's wasmtime store.
pub struct GuestState {
    process: Process,
    limits: StoreLimits,
}

impl ProcessHost for GuestState {
    fn process(&self) -> &Process {
        &self.process
    }

    fn process_mut(&mut self) -> &mut Process {
        &mut self.process
    }
}

/// A compiled, instantiated guest with its entry point located.
///
/// The entry point takes no parameters and returns nothing or a single
/// integer.
pub struct Guest {
    store: Store<GuestState>,
    entry: Func,
    entry_point: String,
    fuel: Option<u64>,
}

impl Guest {
    /// Compile `module`, link its imports against `process` and locate the
    /// configured entry point.
    pub fn instantiate(
        engine: &Engine,
        module: &[u8],
        process: Process,
        config: &RunnerConfig,
    ) -> Result<Self> {
        let module = Module::new(engine, module).map_err(|e| RuntimeError::link("compile", e))?;

        let mut limits = StoreLimitsBuilder::new();
        if let Some(max) = config.max_memory_bytes {
            limits = limits.memory_size(max);
        }
        let mut store = Store::new(
            engine,
            GuestState {
                process,
                limits: limits.build(),
            },
        );
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = config.fuel_per_invocation {
            store
                .set_fuel(fuel)
                .map_err(|e| RuntimeError::link("fuel", e))?;
        }

        let imports = resolve_imports(&mut store, &module)?;
        let instance = Instance::new(&mut store, &module, &imports)
            .map_err(|e| RuntimeError::link("instantiate", e))?;

        let entry = instance
            .get_func(&mut store, &config.entry_point)
            .ok_or_else(|| RuntimeError::MissingEntryPoint(config.entry_point.clone()))?;
        let ty = entry.ty(&store);
        let returns_integer = ty
            .results()
            .all(|result| matches!(result, ValType::I32 | ValType::I64));
        if ty.params().len() != 0 || ty.results().len() > 1 || !returns_integer {
            return Err(RuntimeError::link(
                "entry point",
                format!("{} must take no parameters and return at most one integer", config.entry_point),
            ));
        }

        Ok(Self {
            store,
            entry,
            entry_point: config.entry_point.clone(),
            fuel: config.fuel_per_invocation,
        })
    }

    /// Run the entry point to completion.
    ///
    /// With fuel metering on, the tank is refilled before every call, so one
    /// runaway invocation cannot starve the next.
    pub fn invoke(&mut self) -> Result<i64> {
        let failed = |message: String| RuntimeError::Invocation {
            entry_point: self.entry_point.clone(),
            message,
        };

        if let Some(fuel) = self.fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|e| failed(e.to_string()))?;
        }

        let mut results = vec![Val::I64(0); self.entry.ty(&self.store).results().len()];
        self.entry
            .call(&mut self.store, &[], &mut results)
            .map_err(|e| failed(format!("{:#}", e)))?;

        Ok(match results.first() {
            Some(Val::I32(ret)) => i64::from(*ret),
            Some(Val::I64(ret)) => *ret,
            _ => 0,
        })
    }

    pub fn process(&self) -> &Process {
        &self.store.data().process
    }

    pub fn process_mut(&mut self) -> &mut Process {
        &mut self.store.data_mut().process
    }

    /// Fuel left after the last invocation, when metering is on.
    pub fn fuel_remaining(&self) -> Option<u64> {
        self.fuel.and_then(|_| self.store.get_fuel().ok())
    }
}
