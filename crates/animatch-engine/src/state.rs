use animatch_core::EngineKind;

/// Lifecycle of one embedding engine as seen from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EngineStatus {
    #[default]
    Uninitialized,
    Ready,
    /// Init failed. Not retried until the next release.
    Failed,
}

/// Per-engine status, owned by one analyzer.
#[derive(Debug, Clone, Default)]
pub struct EngineStates {
    general: EngineStatus,
    face: EngineStatus,
}

impl EngineStates {
    pub fn get(&self, kind: EngineKind) -> EngineStatus {
        match kind {
            EngineKind::General => self.general,
            EngineKind::Face => self.face,
        }
    }

    fn slot(&mut self, kind: EngineKind) -> &mut EngineStatus {
        match kind {
            EngineKind::General => &mut self.general,
            EngineKind::Face => &mut self.face,
        }
    }

    pub fn mark_ready(&mut self, kind: EngineKind) {
        *self.slot(kind) = EngineStatus::Ready;
    }

    pub fn mark_failed(&mut self, kind: EngineKind) {
        let slot = self.slot(kind);
        if *slot != EngineStatus::Failed {
            tracing::warn!(engine = %kind, "engine marked failed");
        }
        *slot = EngineStatus::Failed;
    }

    pub fn mark_uninitialized(&mut self, kind: EngineKind) {
        *self.slot(kind) = EngineStatus::Uninitialized;
    }

    /// Both engines back to `Uninitialized`, after their sessions were released.
    pub fn reset(&mut self) {
        self.general = EngineStatus::Uninitialized;
        self.face = EngineStatus::Uninitialized;
    }

    pub fn is_ready(&self, kind: EngineKind) -> bool {
        self.get(kind) == EngineStatus::Ready
    }
}
