//! The embedding surface: construct, run, suspend, resume.
//!
//! A [`Runner`] owns a compiled program (module code + intern tables) and is
//! reusable: each `run`/`start` seeds a fresh heap and module namespace, so
//! reruns with different inputs are independent by construction. External
//! function calls suspend execution into a [`Snapshot`], which the host
//! resumes with a value, defers into a future, or fails with an exception
//! injected at the call site.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde::{Deserialize, Serialize};

use crate::{
    code::{Code, FunctionDef},
    exc::{ExcKind, ExcPayload, RunError},
    exception::Exception,
    heap::Heap,
    intern::{BytesId, FunctionId, Interns, LongIntId, StringId},
    io::PrintWriter,
    object::Object,
    resource::ResourceTracker,
    value::Value,
    vm::{FrameExit, FutureOutcome, Vm, VmState},
};

/// Host-signaled cancellation flag, checked between instructions.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation; the engine raises the cancellation kind at
    /// the next instruction boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub(crate) fn flag(&self) -> &AtomicBool {
        &self.0
    }
}

/// Host policy for refused primitives.
///
/// Wall-clock blocking operations are refused by default; a host may clear
/// or extend the list without an engine change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPolicy {
    /// Builtin names that raise the runtime kind when called.
    pub refused_functions: Vec<String>,
}

impl Default for HostPolicy {
    fn default() -> Self {
        Self {
            refused_functions: vec!["sleep".to_owned()],
        }
    }
}

/// Assembles the interned data of one compiled program.
///
/// The compiler front-end (an external collaborator) drives this alongside
/// [`crate::CodeBuilder`], then finishes into a [`Program`].
#[derive(Debug, Default)]
pub struct ProgramBuilder {
    interns: Interns,
}

impl ProgramBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            interns: Interns::new(),
        }
    }

    /// Interns a name or string literal.
    pub fn intern(&mut self, text: &str) -> StringId {
        self.interns.intern(text)
    }

    /// Interns a bytes literal.
    pub fn intern_bytes(&mut self, data: Vec<u8>) -> BytesId {
        self.interns.intern_bytes(data)
    }

    /// Interns an integer literal exceeding `i64`.
    pub fn intern_big_int(&mut self, value: num_bigint::BigInt) -> LongIntId {
        self.interns.intern_long_int(value)
    }

    /// Registers a compiled function.
    pub fn add_function(&mut self, def: FunctionDef) -> FunctionId {
        self.interns.add_function(def)
    }

    /// Finishes into a program with the given module-level code.
    #[must_use]
    pub fn finish(self, module_code: Code) -> Program {
        Program {
            interns: self.interns,
            module_code,
        }
    }
}

/// A compiled program: the artifact a front-end hands to [`Runner::new`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Program {
    pub(crate) interns: Interns,
    pub(crate) module_code: Code,
}

/// The interpreter handle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Runner {
    interns: Interns,
    module_code: Code,
    input_names: Vec<String>,
    policy: HostPolicy,
    #[serde(skip)]
    cancel: Option<CancelToken>,
}

impl Runner {
    /// Creates a runner from a compiled program.
    ///
    /// `input_names` are module globals the host seeds per run;
    /// `external_functions` declares the names whose calls suspend to the
    /// host.
    pub fn new(program: Program, input_names: Vec<String>, external_functions: Vec<String>) -> Result<Self, Exception> {
        let Program {
            mut interns,
            module_code,
        } = program;
        for name in external_functions {
            interns.add_ext_function(name);
        }
        let runner = Self {
            interns,
            module_code,
            input_names,
            policy: HostPolicy::default(),
            cancel: None,
        };
        for name in &runner.input_names {
            if runner.global_slot_of(name).is_none() {
                return Err(Exception::new(
                    ExcKind::ValueError,
                    Some(format!("input '{name}' has no module-level slot")),
                ));
            }
        }
        Ok(runner)
    }

    /// Replaces the refused-primitive policy.
    #[must_use]
    pub fn with_host_policy(mut self, policy: HostPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Installs a cancellation token polled between instructions.
    pub fn set_cancel_token(&mut self, token: CancelToken) {
        self.cancel = Some(token);
    }

    /// Serializes the runner for caching across processes.
    pub fn dump(&self) -> Result<Vec<u8>, postcard::Error> {
        postcard::to_allocvec(self)
    }

    /// Restores a runner serialized with [`Runner::dump`].
    pub fn load(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }

    fn global_slot_of(&self, name: &str) -> Option<u32> {
        (0..self.module_code.global_count()).find_map(|slot| {
            let slot = u32::try_from(slot).expect("global count fits u32");
            (self.interns.get_str(self.module_code.global_name(slot)) == name).then_some(slot)
        })
    }

    /// Seeds the module namespace: inputs first, then builtins by name.
    fn seed_globals(
        &self,
        inputs: Vec<Object>,
        heap: &mut Heap<impl ResourceTracker>,
    ) -> Result<Vec<Value>, Exception> {
        if inputs.len() != self.input_names.len() {
            return Err(Exception::new(
                ExcKind::ValueError,
                Some(format!(
                    "expected {} input(s), got {}",
                    self.input_names.len(),
                    inputs.len()
                )),
            ));
        }
        let mut globals: Vec<Value> = Vec::with_capacity(self.module_code.global_count());
        for slot in 0..self.module_code.global_count() {
            let slot = u32::try_from(slot).expect("global count fits u32");
            let name = self.interns.get_str(self.module_code.global_name(slot));
            let value = if let Some(position) = self.input_names.iter().position(|n| n == name) {
                inputs[position].to_value(heap, &self.interns)?
            } else if self
                .interns
                .lookup_ext(name)
                .is_some()
            {
                Value::ExtFunction(self.interns.lookup_ext(name).expect("checked above"))
            } else if let Some(builtin) = crate::builtins::builtin_by_name(name) {
                Value::Builtin(builtin)
            } else {
                Value::Undefined
            };
            globals.push(value);
        }
        Ok(globals)
    }

    /// Runs to completion with no external-function support.
    pub fn run<T: ResourceTracker>(
        &self,
        inputs: Vec<Object>,
        tracker: T,
        print: &mut impl PrintWriter,
    ) -> Result<Object, Exception> {
        match self.clone().start(inputs, tracker, print)? {
            RunProgress::Complete(result) => Ok(result),
            RunProgress::FunctionCall { function_name, .. } => Err(Exception::new(
                ExcKind::RuntimeError,
                Some(format!(
                    "external function '{function_name}' called during run(); use start() for external calls"
                )),
            )),
            RunProgress::ResolveFutures { .. } => Err(Exception::new(
                ExcKind::RuntimeError,
                Some("execution blocked on unresolved futures during run()".to_owned()),
            )),
        }
    }

    /// Runs to completion with no resource ceilings, printing to stdout.
    pub fn run_no_limits(&self, inputs: Vec<Object>) -> Result<Object, Exception> {
        self.run(inputs, crate::resource::NoLimitTracker, &mut crate::io::StdPrint)
    }

    /// Starts suspendable execution, consuming this runner into the
    /// resulting state machine.
    pub fn start<T: ResourceTracker>(
        self,
        inputs: Vec<Object>,
        tracker: T,
        print: &mut impl PrintWriter,
    ) -> Result<RunProgress<T>, Exception> {
        let mut heap = Heap::new(tracker);
        let globals = self.seed_globals(inputs, &mut heap)?;
        let mut state = VmState::default();
        state
            .frames
            .push(crate::frame::Frame::module(self.module_code.max_stack()));
        let mut snapshot = Snapshot {
            runner: self,
            heap,
            globals,
            state,
        };
        snapshot.drive(print, None)
    }
}

/// One step of suspendable execution.
#[derive(Debug)]
pub enum RunProgress<T: ResourceTracker> {
    /// Paused at an external function call.
    FunctionCall {
        /// Declared name of the called function.
        function_name: String,
        /// Positional arguments.
        args: Vec<Object>,
        /// Keyword arguments in call order.
        kwargs: Vec<(String, Object)>,
        /// Correlation id for deferred resolution.
        call_id: u32,
        /// The resumable execution state.
        state: Snapshot<T>,
    },
    /// Every runnable task is blocked on unresolved futures; resolve some
    /// and resume.
    ResolveFutures {
        /// Pending correlation ids in declaration order.
        pending: Vec<u32>,
        state: Snapshot<T>,
    },
    /// Execution finished with the value of the final expression.
    Complete(Object),
}

/// Paused execution state, resumable exactly once.
#[derive(Debug, Serialize, Deserialize)]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: serde::de::DeserializeOwned"))]
pub struct Snapshot<T: ResourceTracker> {
    runner: Runner,
    heap: Heap<T>,
    globals: Vec<Value>,
    state: VmState,
}

impl<T: ResourceTracker> Snapshot<T> {
    /// Resumes with the external call's return value.
    pub fn run(mut self, result: Object, print: &mut impl PrintWriter) -> Result<RunProgress<T>, Exception> {
        let value = result.to_value(&mut self.heap, &self.runner.interns)?;
        self.state
            .frames
            .last_mut()
            .expect("suspended state has frames")
            .stack
            .push(value);
        self.drive(print, None)
    }

    /// Resumes by deferring the call into an external future the guest can
    /// await later.
    pub fn run_pending(mut self, print: &mut impl PrintWriter) -> Result<RunProgress<T>, Exception> {
        let call_id = self.state.next_call_id.saturating_sub(1);
        self.state
            .frames
            .last_mut()
            .expect("suspended state has frames")
            .stack
            .push(Value::ExternalFuture(crate::task::CallId::new(call_id)));
        self.drive(print, None)
    }

    /// Resumes by raising an exception at the call site, so guest handlers
    /// see it exactly like a local raise.
    pub fn raise(self, error: Exception, print: &mut impl PrintWriter) -> Result<RunProgress<T>, Exception> {
        let mut payload = ExcPayload::new(error.kind);
        payload.class_name = error.class_name;
        payload.message = error.message;
        self.drive_with(print, Some(RunError::Exc(Box::new(payload.into_raise()))), Vec::new())
    }

    /// Resolves deferred futures (in any order) and resumes.
    pub fn resume(
        self,
        results: Vec<(u32, Result<Object, Exception>)>,
        print: &mut impl PrintWriter,
    ) -> Result<RunProgress<T>, Exception> {
        self.drive_with(print, None, results)
    }

    /// Point-in-time heap statistics, for host observability and leak
    /// tests.
    #[must_use]
    pub fn heap_stats(&self) -> crate::heap::HeapStats {
        self.heap.stats()
    }

    /// Ids of all pending (unresolved) external calls.
    #[must_use]
    pub fn pending_call_ids(&self) -> Vec<u32> {
        self.state
            .gather
            .as_ref()
            .map(|g| g.pending_call_ids().iter().map(|id| id.raw()).collect())
            .unwrap_or_default()
    }

    fn drive(self, print: &mut impl PrintWriter, inject: Option<RunError>) -> Result<RunProgress<T>, Exception> {
        self.drive_with(print, inject, Vec::new())
    }

    /// Runs the dispatcher until the next host exchange.
    fn drive_with(
        mut self,
        print: &mut impl PrintWriter,
        inject: Option<RunError>,
        resolutions: Vec<(u32, Result<Object, Exception>)>,
    ) -> Result<RunProgress<T>, Exception> {
        for (call_id, outcome) in resolutions {
            let outcome = match outcome {
                Ok(object) => FutureOutcome::Value(object.to_value(&mut self.heap, &self.runner.interns)?),
                Err(error) => {
                    let mut payload = ExcPayload::new(error.kind);
                    payload.class_name = error.class_name;
                    payload.message = error.message;
                    FutureOutcome::Error(payload)
                }
            };
            self.state.resolved.insert(call_id, outcome);
        }

        self.heap.tracker_mut().on_resume();
        let Self {
            runner,
            mut heap,
            mut globals,
            state,
        } = self;
        let cancel_flag = runner.cancel.clone();
        let mut vm = Vm::new(
            state,
            &mut heap,
            &mut globals,
            &runner.interns,
            &runner.module_code,
            print,
            &runner.policy.refused_functions,
            cancel_flag.as_ref().map(CancelToken::flag),
        );

        let outcome = match inject {
            Some(err) => match vm.handle_error(err) {
                Ok(()) => vm.run(),
                Err(fatal) => Err(fatal),
            },
            None => vm.run(),
        };
        let state = vm.into_state();

        match outcome {
            Ok(FrameExit::Return(value)) => {
                let result = Object::from_value(&value, &heap, &runner.interns);
                value.drop_with_heap(&mut heap);
                // Teardown: release the module namespace, then one tracing
                // pass reclaims any cycles.
                for global in globals {
                    global.drop_with_heap(&mut heap);
                }
                let _ = heap.collect_cycles(std::iter::empty());
                Ok(RunProgress::Complete(result))
            }
            Ok(FrameExit::ExternalCall {
                ext_id,
                args,
                kwargs,
                call_id,
            }) => {
                heap.tracker_mut().on_suspend();
                let function_name = runner.interns.get_ext_name(ext_id).to_owned();
                let mut arg_objects = Vec::with_capacity(args.len());
                for value in args {
                    arg_objects.push(Object::from_value(&value, &heap, &runner.interns));
                    value.drop_with_heap(&mut heap);
                }
                let mut kwarg_objects = Vec::with_capacity(kwargs.len());
                for (name, value) in kwargs {
                    kwarg_objects.push((name, Object::from_value(&value, &heap, &runner.interns)));
                    value.drop_with_heap(&mut heap);
                }
                Ok(RunProgress::FunctionCall {
                    function_name,
                    args: arg_objects,
                    kwargs: kwarg_objects,
                    call_id: call_id.raw(),
                    state: Snapshot {
                        runner,
                        heap,
                        globals,
                        state,
                    },
                })
            }
            Ok(FrameExit::ResolveFutures(pending)) => {
                heap.tracker_mut().on_suspend();
                Ok(RunProgress::ResolveFutures {
                    pending: pending.iter().map(|id| id.raw()).collect(),
                    state: Snapshot {
                        runner,
                        heap,
                        globals,
                        state,
                    },
                })
            }
            Err(error) => Err(finalize_error(error, &runner, &mut heap)),
        }
    }
}

/// Converts an uncaught internal error into the public exception, releasing
/// any guest instance it carried.
fn finalize_error(error: RunError, runner: &Runner, heap: &mut Heap<impl ResourceTracker>) -> Exception {
    match error {
        RunError::Exc(raise) | RunError::Uncatchable(raise) => {
            if let Some(original) = raise.original {
                original.drop_with_heap(heap);
            }
            let line_text = |source: &str, line: u32| runner.source_line(source, line);
            Exception::from_payload(&raise.exc, &runner.interns, &line_text)
        }
        RunError::Internal(message) => Exception::new(
            ExcKind::RuntimeError,
            Some(format!("internal interpreter error: {message}")),
        ),
    }
}

impl Runner {
    /// Quoted source text for a traceback line, when a code object carrying
    /// that source attached it.
    fn source_line(&self, source: &str, line: u32) -> Option<String> {
        if self.interns.get_str(self.module_code.source_id()) == source
            && let Some(text) = self.module_code.source_line_text(line)
        {
            return Some(text.to_owned());
        }
        None
    }
}
