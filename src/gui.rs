//! Menu tree collaborator. The scripting core attaches and detaches controls
//! here but never lays them out.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::hash::fnv1a64;

#[derive(Clone, Debug, PartialEq)]
pub enum ControlKind {
    Tab,
    Group,
    Layout,
    Checkbox,
    Slider { min: f32, max: f32, step: f32, format: String },
    Combobox { options: Vec<String>, multi: bool },
    List { options: Vec<String>, multi: bool },
    Textbox,
    Label,
    Button,
    ColorPicker,
}

impl ControlKind {
    pub fn name(&self) -> &'static str {
        match self {
            ControlKind::Tab => "tab",
            ControlKind::Group => "group",
            ControlKind::Layout => "layout",
            ControlKind::Checkbox => "checkbox",
            ControlKind::Slider { .. } => "slider",
            ControlKind::Combobox { .. } => "combobox",
            ControlKind::List { .. } => "list",
            ControlKind::Textbox => "textbox",
            ControlKind::Label => "label",
            ControlKind::Button => "button",
            ControlKind::ColorPicker => "color_picker",
        }
    }

    pub fn is_container(&self) -> bool {
        matches!(self, ControlKind::Group | ControlKind::Layout)
    }
}

#[derive(Clone, Debug)]
pub struct Control {
    pub id: u64,
    pub name: String,
    pub label: String,
    pub parent: Option<u64>,
    pub kind: ControlKind,
    pub tooltip: Option<String>,
    pub visible: bool,
    pub highlighted: bool,
}

impl Control {
    pub fn new(id_str: &str, label: &str, kind: ControlKind) -> Self {
        Self {
            id: fnv1a64(id_str),
            name: id_str.to_string(),
            label: label.to_string(),
            parent: None,
            kind,
            tooltip: None,
            visible: true,
            highlighted: false,
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HotkeyMode {
    Toggle,
    Hold,
}

#[derive(Clone, Debug)]
pub struct Hotkey {
    pub control_id: u64,
    pub key: u32,
    pub mode: HotkeyMode,
    pub active: bool,
}

pub trait GuiTree {
    fn find(&self, id: u64) -> Option<&Control>;
    fn find_mut(&mut self, id: u64) -> Option<&mut Control>;
    fn add(&mut self, parent: u64, control: Control) -> Result<(), String>;
    fn remove(&mut self, id: u64) -> bool;
    fn process_queues(&mut self);
    fn reset(&mut self);
    /// Marks the nearest enclosing tab so users can see it holds script controls.
    fn highlight_tab(&mut self, id: u64);
    fn hotkeys(&self) -> Vec<Hotkey>;
    fn bind_hotkey(&mut self, control_id: u64, key: u32, mode: HotkeyMode);
    fn remove_hotkey(&mut self, control_id: u64);
    fn notify(&mut self, title: &str, body: &str);
    fn is_open(&self) -> bool;
}

/// In-process tree used headless and in tests.
#[derive(Default)]
pub struct MemoryGui {
    controls: HashMap<u64, Control>,
    children: HashMap<u64, Vec<u64>>,
    pending_layout: Vec<u64>,
    hotkeys: Vec<Hotkey>,
    pub notifications: Vec<(String, String)>,
    pub open: bool,
    pub resets: u64,
}

impl MemoryGui {
    /// Builds a tree with one `scripts` tab holding a `scripts.main` group.
    pub fn with_default_layout() -> Self {
        let mut gui = MemoryGui::default();
        gui.insert_root(Control::new("scripts", "Scripts", ControlKind::Tab));
        let group = Control::new("scripts.main", "Main", ControlKind::Group);
        let _ = gui.add(fnv1a64("scripts"), group);
        gui.pending_layout.clear();
        gui
    }

    pub fn insert_root(&mut self, control: Control) {
        self.controls.insert(control.id, control);
    }

    #[cfg(test)]
    pub fn children_of(&self, id: u64) -> &[u64] {
        self.children.get(&id).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl GuiTree for MemoryGui {
    fn find(&self, id: u64) -> Option<&Control> {
        self.controls.get(&id)
    }

    fn find_mut(&mut self, id: u64) -> Option<&mut Control> {
        self.controls.get_mut(&id)
    }

    fn add(&mut self, parent: u64, mut control: Control) -> Result<(), String> {
        if !self.controls.contains_key(&parent) {
            return Err(format!("parent {parent:#x} does not exist"));
        }
        if self.controls.contains_key(&control.id) {
            return Err(format!("control {} already exists", control.name));
        }
        control.parent = Some(parent);
        self.children.entry(parent).or_default().push(control.id);
        self.pending_layout.push(control.id);
        self.controls.insert(control.id, control);
        Ok(())
    }

    fn remove(&mut self, id: u64) -> bool {
        let Some(control) = self.controls.remove(&id) else {
            return false;
        };
        if let Some(parent) = control.parent {
            if let Some(siblings) = self.children.get_mut(&parent) {
                siblings.retain(|c| *c != id);
            }
        }
        if let Some(children) = self.children.remove(&id) {
            for child in children {
                self.remove(child);
            }
        }
        self.pending_layout.retain(|c| *c != id);
        self.hotkeys.retain(|h| h.control_id != id);
        true
    }

    fn process_queues(&mut self) {
        self.pending_layout.clear();
    }

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn highlight_tab(&mut self, id: u64) {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let Some(control) = self.controls.get_mut(&current) else {
                return;
            };
            if control.kind == ControlKind::Tab {
                control.highlighted = true;
                return;
            }
            cursor = control.parent;
        }
    }

    fn hotkeys(&self) -> Vec<Hotkey> {
        self.hotkeys.clone()
    }

    fn bind_hotkey(&mut self, control_id: u64, key: u32, mode: HotkeyMode) {
        self.hotkeys.retain(|h| h.control_id != control_id);
        self.hotkeys.push(Hotkey {
            control_id,
            key,
            mode,
            active: false,
        });
    }

    fn remove_hotkey(&mut self, control_id: u64) {
        self.hotkeys.retain(|h| h.control_id != control_id);
    }

    fn notify(&mut self, title: &str, body: &str) {
        self.notifications.push((title.to_string(), body.to_string()));
    }

    fn is_open(&self) -> bool {
        self.open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_highlights_only_through_explicit_call() {
        let mut gui = MemoryGui::with_default_layout();
        let group = fnv1a64("scripts.main");
        let checkbox = Control::new("my.cb", "Enabled", ControlKind::Checkbox);
        let id = checkbox.id;
        gui.add(group, checkbox).expect("add checkbox");
        assert!(!gui.find(fnv1a64("scripts")).expect("tab").highlighted);
        gui.highlight_tab(id);
        assert!(gui.find(fnv1a64("scripts")).expect("tab").highlighted);
    }

    #[test]
    fn remove_detaches_children_and_hotkeys() {
        let mut gui = MemoryGui::with_default_layout();
        let group = fnv1a64("scripts.main");
        let layout = Control::new("my.layout", "Inline", ControlKind::Layout);
        let layout_id = layout.id;
        gui.add(group, layout).expect("add layout");
        let button = Control::new("my.button", "Go", ControlKind::Button);
        let button_id = button.id;
        gui.add(layout_id, button).expect("add button");
        gui.bind_hotkey(button_id, 0x46, HotkeyMode::Toggle);

        assert!(gui.remove(layout_id));
        assert!(gui.find(button_id).is_none());
        assert!(gui.hotkeys().is_empty());
        assert!(!gui.children_of(group).contains(&layout_id));
    }

    #[test]
    fn rejects_missing_parent_and_duplicates() {
        let mut gui = MemoryGui::with_default_layout();
        assert!(gui
            .add(42, Control::new("orphan", "Orphan", ControlKind::Label))
            .is_err());
        let group = fnv1a64("scripts.main");
        gui.add(group, Control::new("dup", "Dup", ControlKind::Label))
            .expect("first add");
        assert!(gui
            .add(group, Control::new("dup", "Dup", ControlKind::Label))
            .is_err());
    }
}
