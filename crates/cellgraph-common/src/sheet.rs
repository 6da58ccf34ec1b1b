//! Sheet name <-> id mapping.

use std::collections::HashMap;

use crate::SheetId;

/// Bidirectional sheet name/id registry.
///
/// Removed sheets leave a tombstone: the id is never handed out again, so a
/// stale `SheetId` held by a pending transformation stays unambiguous.
#[derive(Default, Debug)]
pub struct SheetRegistry {
    id_by_name: HashMap<String, SheetId>,
    name_by_id: Vec<Option<String>>,
}

impl SheetRegistry {
    pub fn new() -> Self {
        SheetRegistry::default()
    }

    /// Returns the id for a sheet name, creating one if it does not exist.
    pub fn id_for(&mut self, name: &str) -> SheetId {
        if let Some(&id) = self.id_by_name.get(name) {
            return id;
        }

        let id = self.name_by_id.len() as SheetId;
        self.name_by_id.push(Some(name.to_string()));
        self.id_by_name.insert(name.to_string(), id);
        id
    }

    pub fn get_id(&self, name: &str) -> Option<SheetId> {
        self.id_by_name.get(name).copied()
    }

    /// Name of a live sheet. Panics on an id that was never allocated or has
    /// been removed; use [`SheetRegistry::try_name`] when unsure.
    pub fn name(&self, id: SheetId) -> &str {
        self.name_by_id[id as usize]
            .as_deref()
            .expect("sheet was removed")
    }

    pub fn try_name(&self, id: SheetId) -> Option<&str> {
        self.name_by_id.get(id as usize)?.as_deref()
    }

    pub fn contains(&self, id: SheetId) -> bool {
        self.try_name(id).is_some()
    }

    /// Tombstone a sheet, returning its name. The id is not reused.
    pub fn remove(&mut self, id: SheetId) -> Option<String> {
        let slot = self.name_by_id.get_mut(id as usize)?;
        let name = slot.take()?;
        self.id_by_name.remove(&name);
        Some(name)
    }

    /// Live sheets, in allocation order.
    pub fn iter(&self) -> impl Iterator<Item = (SheetId, &str)> + '_ {
        self.name_by_id
            .iter()
            .enumerate()
            .filter_map(|(i, n)| n.as_deref().map(|n| (i as SheetId, n)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_stable_and_never_reused() {
        let mut reg = SheetRegistry::new();
        let a = reg.id_for("Sheet1");
        let b = reg.id_for("Data");
        assert_eq!(reg.id_for("Sheet1"), a);
        assert_eq!(reg.name(b), "Data");

        assert_eq!(reg.remove(b), Some("Data".to_string()));
        assert!(!reg.contains(b));
        let c = reg.id_for("Data");
        assert_ne!(b, c);
        assert_eq!(reg.try_name(b), None);
    }
}
