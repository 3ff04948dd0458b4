use std::{fmt, sync::Arc};

type Notify = Arc<dyn Fn() + Send + Sync>;
type OnExit = Arc<dyn Fn(Option<i32>) + Send + Sync>;
type OnLine = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional callbacks fired by the supervisor as the game moves through its
/// lifecycle. Callbacks run on supervisor tasks and must not block.
#[derive(Clone, Default)]
pub struct LifecycleHooks {
    process_started: Option<Notify>,
    process_exited: Option<OnExit>,
    game_ready: Option<Notify>,
    game_stopping: Option<Notify>,
    input_line: Option<OnLine>,
}

impl fmt::Debug for LifecycleHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleHooks")
            .field("process_started", &self.process_started.is_some())
            .field("process_exited", &self.process_exited.is_some())
            .field("game_ready", &self.game_ready.is_some())
            .field("game_stopping", &self.game_stopping.is_some())
            .field("input_line", &self.input_line.is_some())
            .finish()
    }
}

impl LifecycleHooks {
    pub fn builder() -> LifecycleHooksBuilder {
        LifecycleHooksBuilder::default()
    }

    pub(crate) fn process_started(&self) {
        if let Some(f) = &self.process_started {
            f();
        }
    }

    pub(crate) fn process_exited(&self, code: Option<i32>) {
        if let Some(f) = &self.process_exited {
            f(code);
        }
    }

    pub(crate) fn game_ready(&self) {
        if let Some(f) = &self.game_ready {
            f();
        }
    }

    pub(crate) fn game_stopping(&self) {
        if let Some(f) = &self.game_stopping {
            f();
        }
    }

    /// A line read from the game's console.
    pub(crate) fn input_line(&self, line: &str) {
        if let Some(f) = &self.input_line {
            f(line);
        }
    }
}

#[derive(Default)]
pub struct LifecycleHooksBuilder {
    hooks: LifecycleHooks,
}

impl LifecycleHooksBuilder {
    pub fn on_process_started(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.process_started = Some(Arc::new(f));
        self
    }

    pub fn on_process_exited(mut self, f: impl Fn(Option<i32>) + Send + Sync + 'static) -> Self {
        self.hooks.process_exited = Some(Arc::new(f));
        self
    }

    pub fn on_game_ready(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.game_ready = Some(Arc::new(f));
        self
    }

    pub fn on_game_stopping(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.hooks.game_stopping = Some(Arc::new(f));
        self
    }

    pub fn on_input_line(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.hooks.input_line = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> LifecycleHooks {
        self.hooks
    }
}
