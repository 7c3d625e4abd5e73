//! Shared helpers for assembling programs by hand.
//!
//! The compiler front-end is an external collaborator, so tests lower tiny
//! scripts into code objects directly through the public builder API.

// Each test binary uses a different subset of these helpers.
#![allow(dead_code)]

use basilisk::{Code, CodeBuilder, FunctionDef, Object, ParamSpec, ProgramBuilder, Runner, StringId};

/// A module under assembly: names, functions, and the module body builder.
pub struct ModuleAssembler {
    pub program: ProgramBuilder,
    pub source_id: StringId,
}

impl ModuleAssembler {
    pub fn new(source: &str) -> Self {
        let mut program = ProgramBuilder::new();
        let source_id = program.intern(source);
        Self { program, source_id }
    }

    /// Starts the module-level code builder.
    pub fn module_code(&mut self) -> CodeBuilder {
        let qualname = self.program.intern("<module>");
        CodeBuilder::new(self.source_id, qualname)
    }

    /// Starts a function code builder with the given qualified name.
    pub fn function_code(&mut self, qualname: &str) -> CodeBuilder {
        let qualname = self.program.intern(qualname);
        CodeBuilder::new(self.source_id, qualname)
    }

    /// Registers a plain synchronous function.
    pub fn add_function(&mut self, qualname: &str, code: Code, params: ParamSpec) -> basilisk::FunctionId {
        let qualname_id = self.program.intern(qualname);
        self.program.add_function(FunctionDef {
            qualname_id,
            code,
            params,
            is_generator: false,
            is_async: false,
        })
    }

    /// Registers a generator function.
    pub fn add_generator(&mut self, qualname: &str, code: Code, params: ParamSpec) -> basilisk::FunctionId {
        let qualname_id = self.program.intern(qualname);
        self.program.add_function(FunctionDef {
            qualname_id,
            code,
            params,
            is_generator: true,
            is_async: false,
        })
    }

    /// Registers an async function.
    pub fn add_async(&mut self, qualname: &str, code: Code, params: ParamSpec) -> basilisk::FunctionId {
        let qualname_id = self.program.intern(qualname);
        self.program.add_function(FunctionDef {
            qualname_id,
            code,
            params,
            is_generator: false,
            is_async: true,
        })
    }

    /// Finishes into a runner with no inputs and no externals.
    pub fn runner(self, module: Code) -> Runner {
        Runner::new(self.program.finish(module), vec![], vec![]).expect("runner construction")
    }

    /// Finishes into a runner with declared inputs and externals.
    pub fn runner_with(self, module: Code, inputs: &[&str], externals: &[&str]) -> Runner {
        Runner::new(
            self.program.finish(module),
            inputs.iter().map(|s| (*s).to_owned()).collect(),
            externals.iter().map(|s| (*s).to_owned()).collect(),
        )
        .expect("runner construction")
    }
}

/// Positional-only parameter spec with `n` names.
pub fn params(names: &[StringId]) -> ParamSpec {
    ParamSpec {
        positional: names.to_vec(),
        ..ParamSpec::default()
    }
}

/// Runs with no limits and unwraps the result.
pub fn run_ok(runner: &Runner, inputs: Vec<Object>) -> Object {
    runner.run_no_limits(inputs).expect("script should succeed")
}

/// Runs with no limits and unwraps the failure.
pub fn run_err(runner: &Runner, inputs: Vec<Object>) -> basilisk::Exception {
    runner.run_no_limits(inputs).expect_err("script should fail")
}
