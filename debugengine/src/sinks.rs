/// Data sinks
///
/// Passive receivers for decoded backend data. They hold whatever the last
/// response said and are cleared when a session ends.

use std::collections::BTreeMap;

use crate::types::Value;

/// Which sink a data update touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SinkKind {
    Stack,
    Threads,
    Modules,
    Registers,
    Watches,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackFrame {
    pub level: i64,
    pub function: String,
    pub file: String,
    pub line: i64,
    pub address: u64,
    pub module: String,
    pub usable: bool,
}

impl StackFrame {
    pub fn from_value(value: &Value) -> Self {
        let file = value.field("file").to_string();
        let line = value.get("line").map(Value::to_int).unwrap_or(0);
        let usable = match value.get("usable") {
            Some(flag) => flag.to_bool(),
            None => !file.is_empty() && line > 0,
        };
        Self {
            level: value.get("level").map(Value::to_int).unwrap_or(0),
            function: value.field("func").to_string(),
            file,
            line,
            address: value.get("addr").map(Value::to_address).unwrap_or(0),
            module: value.field("module").to_string(),
            usable,
        }
    }
}

#[derive(Debug, Default)]
pub struct StackHandler {
    frames: Vec<StackFrame>,
    current: usize,
    can_expand: bool,
}

impl StackHandler {
    pub fn set_frames(&mut self, frames: Vec<StackFrame>, can_expand: bool) {
        self.frames = frames;
        self.can_expand = can_expand;
        if self.current >= self.frames.len() {
            self.current = 0;
        }
    }

    pub fn frames(&self) -> &[StackFrame] {
        &self.frames
    }

    pub fn frame_at(&self, index: usize) -> Option<&StackFrame> {
        self.frames.get(index)
    }

    pub fn stack_size(&self) -> usize {
        self.frames.len()
    }

    pub fn can_expand(&self) -> bool {
        self.can_expand
    }

    pub fn current_index(&self) -> usize {
        self.current
    }

    pub fn set_current_index(&mut self, index: usize) {
        if index < self.frames.len() {
            self.current = index;
        }
    }

    pub fn current_frame(&self) -> Option<&StackFrame> {
        self.frames.get(self.current)
    }

    /// First frame with source information, or the top frame.
    pub fn first_usable_index(&self) -> usize {
        self.frames.iter().position(|frame| frame.usable).unwrap_or(0)
    }

    pub fn remove_all(&mut self) {
        self.frames.clear();
        self.current = 0;
        self.can_expand = false;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ThreadInfo {
    pub id: String,
    pub name: String,
    pub state: String,
    pub function: String,
    pub file: String,
    pub line: i64,
    pub address: u64,
    pub stop_reason: String,
}

impl ThreadInfo {
    pub fn from_value(value: &Value) -> Self {
        Self {
            id: value.field("id").to_string(),
            name: value.field("name").to_string(),
            state: value.field("state").to_string(),
            function: value.field("func").to_string(),
            file: value.field("file").to_string(),
            line: value.get("line").map(Value::to_int).unwrap_or(0),
            address: value.get("addr").map(Value::to_address).unwrap_or(0),
            stop_reason: value.field("stop-reason").to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ThreadsHandler {
    threads: Vec<ThreadInfo>,
    current: Option<String>,
}

impl ThreadsHandler {
    /// Accepts `{threads=[...],current-thread-id="n"}` or a bare list.
    pub fn update(&mut self, value: &Value) {
        let list = match value.get("threads") {
            Some(threads) => threads.children(),
            None => value.children(),
        };
        self.threads = list.into_iter().map(ThreadInfo::from_value).collect();

        let current = value.field("current-thread-id");
        if !current.is_empty() {
            self.current = Some(current.to_string());
        } else if !self
            .current
            .as_ref()
            .is_some_and(|id| self.threads.iter().any(|thread| &thread.id == id))
        {
            self.current = self.threads.first().map(|thread| thread.id.clone());
        }
    }

    pub fn notify_running(&mut self) {
        for thread in &mut self.threads {
            thread.state = "running".to_string();
            thread.stop_reason.clear();
        }
    }

    pub fn threads(&self) -> &[ThreadInfo] {
        &self.threads
    }

    pub fn thread_at(&self, index: usize) -> Option<&ThreadInfo> {
        self.threads.get(index)
    }

    pub fn current(&self) -> Option<&ThreadInfo> {
        let id = self.current.as_ref()?;
        self.threads.iter().find(|thread| &thread.id == id)
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    pub fn set_current(&mut self, id: &str) {
        self.current = Some(id.to_string());
    }

    pub fn remove_all(&mut self) {
        self.threads.clear();
        self.current = None;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Module {
    pub path: String,
    pub name: String,
    pub start_address: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Symbol {
    pub address: u64,
    pub name: String,
    pub state: String,
    pub section: String,
    pub demangled: String,
}

impl Symbol {
    pub fn from_value(value: &Value) -> Self {
        Self {
            address: value.get("address").map(Value::to_address).unwrap_or(0),
            name: value.field("name").to_string(),
            state: value.field("state").to_string(),
            section: value.field("section").to_string(),
            demangled: value.field("demangled").to_string(),
        }
    }
}

#[derive(Debug, Default)]
pub struct ModulesHandler {
    modules: Vec<Module>,
}

impl ModulesHandler {
    pub fn update(&mut self, value: &Value) {
        self.modules = value
            .children()
            .into_iter()
            .map(|item| Module {
                path: item.field("file").to_string(),
                name: item.field("name").to_string(),
                start_address: item.get("loaded_addr").map(Value::to_address).unwrap_or(0),
            })
            .collect();
    }

    pub fn modules(&self) -> &[Module] {
        &self.modules
    }

    pub fn remove_all(&mut self) {
        self.modules.clear();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Register {
    pub name: String,
    pub value: String,
    pub size: i64,
    pub reg_type: String,
}

#[derive(Debug, Default)]
pub struct RegisterHandler {
    registers: Vec<Register>,
}

impl RegisterHandler {
    pub fn update(&mut self, value: &Value) {
        self.registers = value
            .children()
            .into_iter()
            .map(|item| Register {
                name: item.field("name").to_string(),
                value: item.field("value").to_string(),
                size: item.get("size").map(Value::to_int).unwrap_or(0),
                reg_type: item.field("type").to_string(),
            })
            .collect();
    }

    pub fn registers(&self) -> &[Register] {
        &self.registers
    }

    pub fn get(&self, name: &str) -> Option<&Register> {
        self.registers.iter().find(|reg| reg.name == name)
    }

    pub fn remove_all(&mut self) {
        self.registers.clear();
    }
}

/// A local, watched expression or one of their children, keyed by iname
/// such as `local.argv.0` or `watch.1`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WatchItem {
    pub iname: String,
    pub name: String,
    pub value: String,
    pub type_name: String,
    pub children: usize,
}

#[derive(Debug, Default)]
pub struct WatchHandler {
    items: BTreeMap<String, WatchItem>,
    watchers: Vec<(String, String)>,
    next_watcher: usize,
}

impl WatchHandler {
    /// Merge a `data` payload. Top-level items missing from a full update
    /// are dropped together with their children.
    pub fn refresh_locals(&mut self, value: &Value, partial: bool) {
        let mut seen = Vec::new();
        for item in value.children() {
            self.insert_item(item, "", &mut seen);
        }

        if !partial {
            self.items.retain(|iname, _| {
                let top = top_level(iname);
                seen.iter().any(|s| s == &top)
            });
        }
    }

    fn insert_item(&mut self, item: &Value, parent: &str, seen: &mut Vec<String>) {
        let iname = match item.field("iname") {
            "" if parent.is_empty() => return,
            "" => format!("{}.{}", parent, item.field("name")),
            iname => iname.to_string(),
        };
        let name = match item.get("wname") {
            Some(wname) => wname.hex_text(),
            None => item.field("name").to_string(),
        };

        let children = item.get("children").map(Value::children).unwrap_or_default();
        let top = top_level(&iname);
        if !seen.contains(&top) {
            seen.push(top);
        }

        self.items.insert(
            iname.clone(),
            WatchItem {
                iname: iname.clone(),
                name,
                value: item.field("value").to_string(),
                type_name: item.field("type").to_string(),
                children: children
                    .len()
                    .max(usize::try_from(item.get("numchild").map(Value::to_int).unwrap_or(0)).unwrap_or(0)),
            },
        );
        for child in children {
            self.insert_item(child, &iname, seen);
        }
    }

    pub fn item(&self, iname: &str) -> Option<&WatchItem> {
        self.items.get(iname)
    }

    pub fn items(&self) -> impl Iterator<Item = &WatchItem> {
        self.items.values()
    }

    /// Register a watched expression; returns its iname.
    pub fn add_watcher(&mut self, expression: &str) -> String {
        if let Some((iname, _)) = self.watchers.iter().find(|(_, exp)| exp == expression) {
            return iname.clone();
        }
        let iname = format!("watch.{}", self.next_watcher);
        self.next_watcher += 1;
        self.watchers.push((iname.clone(), expression.to_string()));
        iname
    }

    pub fn remove_watcher(&mut self, iname: &str) {
        self.watchers.retain(|(name, _)| name != iname);
        let prefix = format!("{}.", iname);
        self.items
            .retain(|name, _| name != iname && !name.starts_with(&prefix));
    }

    /// `(iname, expression)` pairs in registration order.
    pub fn watchers(&self) -> &[(String, String)] {
        &self.watchers
    }

    /// Forget values, keep the watched expressions.
    pub fn cleanup(&mut self) {
        self.items.clear();
    }
}

/// `local.a.b` -> `local.a`
fn top_level(iname: &str) -> String {
    iname.splitn(3, '.').take(2).collect::<Vec<_>>().join(".")
}

/// One disassembled instruction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DisassemblerLine {
    pub address: u64,
    pub instruction: String,
    pub function: String,
    pub offset: i64,
    pub comment: String,
}

impl DisassemblerLine {
    pub fn from_value(value: &Value) -> Self {
        Self {
            address: value.get("address").map(Value::to_address).unwrap_or(0),
            instruction: value.field("inst").to_string(),
            function: value.field("func-name").to_string(),
            offset: value.get("offset").map(Value::to_int).unwrap_or(0),
            comment: value.field("comment").to_string(),
        }
    }
}

/// Every sink one engine feeds.
#[derive(Debug, Default)]
pub struct DataSinks {
    pub stack: StackHandler,
    pub threads: ThreadsHandler,
    pub modules: ModulesHandler,
    pub registers: RegisterHandler,
    pub watches: WatchHandler,
}

impl DataSinks {
    pub fn clear_all(&mut self) {
        self.stack.remove_all();
        self.threads.remove_all();
        self.modules.remove_all();
        self.registers.remove_all();
        self.watches.cleanup();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::decode_block;
    use pretty_assertions::assert_eq;

    fn field(text: &str, name: &str) -> Value {
        decode_block(text).unwrap().get(name).unwrap().clone()
    }

    #[test]
    fn test_stack_frames_and_usable_index() {
        let stack = field(
            r#"stack={frames=[{level="0",func="memcpy",addr="0x7f00"},{level="1",func="main",file="a.c",line="12"}],hasmore="1"}"#,
            "stack",
        );
        let frames: Vec<_> = stack.get("frames").unwrap().children().into_iter().map(StackFrame::from_value).collect();

        let mut handler = StackHandler::default();
        handler.set_frames(frames, stack.field("hasmore") == "1");
        assert_eq!(handler.stack_size(), 2);
        assert!(handler.can_expand());
        assert_eq!(handler.first_usable_index(), 1);
        assert_eq!(handler.frame_at(0).unwrap().address, 0x7f00);

        handler.set_current_index(5);
        assert_eq!(handler.current_index(), 0);
        handler.set_current_index(1);
        assert_eq!(handler.current_frame().unwrap().function, "main");
    }

    #[test]
    fn test_threads_update_and_running() {
        let mut handler = ThreadsHandler::default();
        handler.update(&field(
            r#"threads={threads=[{id="1",state="stopped",stop-reason="breakpoint"},{id="2",state="stopped"}],current-thread-id="2"}"#,
            "threads",
        ));
        assert_eq!(handler.current().unwrap().id, "2");

        handler.notify_running();
        assert!(handler.threads().iter().all(|t| t.state == "running" && t.stop_reason.is_empty()));

        handler.update(&field(r#"threads=[{id="7"}]"#, "threads"));
        assert_eq!(handler.current_id(), Some("7"));
    }

    #[test]
    fn test_watch_refresh_purges_stale_items() {
        let mut handler = WatchHandler::default();
        handler.refresh_locals(
            &field(
                r#"data=[{iname="local.a",name="a",value="1",type="int"},{iname="local.s",name="s",children=[{name="x",value="2"}]}]"#,
                "data",
            ),
            false,
        );
        assert_eq!(handler.item("local.s.x").unwrap().value, "2");
        assert_eq!(handler.item("local.s").unwrap().children, 1);

        handler.refresh_locals(&field(r#"data=[{iname="local.a",name="a",value="3"}]"#, "data"), false);
        assert_eq!(handler.item("local.a").unwrap().value, "3");
        assert!(handler.item("local.s").is_none());
        assert!(handler.item("local.s.x").is_none());
    }

    #[test]
    fn test_watchers_get_stable_inames() {
        let mut handler = WatchHandler::default();
        assert_eq!(handler.add_watcher("x + 1"), "watch.0");
        assert_eq!(handler.add_watcher("y"), "watch.1");
        assert_eq!(handler.add_watcher("x + 1"), "watch.0");

        handler.refresh_locals(&field(r#"data=[{iname="watch.1",wname="79",value="5"}]"#, "data"), true);
        assert_eq!(handler.item("watch.1").unwrap().name, "y");

        handler.remove_watcher("watch.1");
        assert_eq!(handler.watchers().len(), 1);
        assert!(handler.item("watch.1").is_none());
    }

    #[test]
    fn test_registers_modules_and_clear() {
        let mut sinks = DataSinks::default();
        sinks
            .registers
            .update(&field(r#"registers=[{name="rip",value="0x401000",size="8",type="code"}]"#, "registers"));
        sinks
            .modules
            .update(&field(r#"modules=[{file="/lib/libc.so",name="libc.so",loaded_addr="0x7f0000"}]"#, "modules"));
        assert_eq!(sinks.registers.get("rip").unwrap().size, 8);
        assert_eq!(sinks.modules.modules()[0].start_address, 0x7f0000);

        sinks.watches.add_watcher("z");
        sinks.clear_all();
        assert!(sinks.registers.registers().is_empty());
        assert!(sinks.modules.modules().is_empty());
        assert_eq!(sinks.watches.watchers().len(), 1);
    }

    #[test]
    fn test_disassembler_line() {
        let line = DisassemblerLine::from_value(&field(
            r#"line={address="0x1000",inst="mov eax, 1",func-name="main",offset="4"}"#,
            "line",
        ));
        assert_eq!(line.address, 0x1000);
        assert_eq!(line.offset, 4);
        assert_eq!(line.function, "main");
    }
}
