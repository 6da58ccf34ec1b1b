//! Edit events for the external undo/redo ledger.
//!
//! Each structural event carries the affected span, snapshots of displaced
//! cells, and the transformation-log version at edit time — enough for a
//! ledger to invert the edit. The engine itself never replays these.

use cellgraph_common::{CellAddress, CellRange, CellValue, SheetId};
use cellgraph_parse::AstNode;

/// Content of one cell as it was immediately before an edit displaced it.
#[derive(Debug, Clone)]
pub struct CellSnapshot {
    pub value: Option<CellValue>,
    pub formula: Option<AstNode>,
}

impl CellSnapshot {
    pub fn empty() -> Self {
        Self {
            value: None,
            formula: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum ChangeEvent {
    SetContent {
        address: CellAddress,
        old: CellSnapshot,
    },
    RowsInserted {
        sheet: SheetId,
        row: u32,
        count: u32,
        version: u64,
    },
    RowsRemoved {
        sheet: SheetId,
        row: u32,
        count: u32,
        displaced: Vec<(CellAddress, CellSnapshot)>,
        version: u64,
    },
    ColumnsInserted {
        sheet: SheetId,
        col: u32,
        count: u32,
        version: u64,
    },
    ColumnsRemoved {
        sheet: SheetId,
        col: u32,
        count: u32,
        displaced: Vec<(CellAddress, CellSnapshot)>,
        version: u64,
    },
    CellsMoved {
        source: CellRange,
        to: CellAddress,
        displaced: Vec<(CellAddress, CellSnapshot)>,
        version: u64,
    },
    SheetRemoved {
        sheet: SheetId,
        displaced: Vec<(CellAddress, CellSnapshot)>,
        version: u64,
    },
}

#[derive(Debug, Default)]
pub struct ChangeLog {
    events: Vec<ChangeEvent>,
    enabled: bool,
}

impl ChangeLog {
    pub fn new(enabled: bool) -> Self {
        Self {
            events: Vec::new(),
            enabled,
        }
    }

    pub fn push(&mut self, event: ChangeEvent) {
        if self.enabled {
            self.events.push(event);
        }
    }

    pub fn events(&self) -> &[ChangeEvent] {
        &self.events
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
