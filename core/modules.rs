// Copyright 2018-2026 the Deno authors. MIT license.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use crate::isolate::IsolateState;

/// Registry assigned module id. 0 means "no module".
pub type ModuleId = i32;
pub type DynImportId = i32;

/// Answers the engine's "which module does `specifier` refer to" questions
/// during `Isolate::mod_instantiate`. Returning 0 (or an id the isolate does
/// not know) fails instantiation.
pub trait ResolveHandler {
  fn resolve(
    &mut self,
    specifier: &str,
    referrer: &str,
    referrer_id: ModuleId,
  ) -> ModuleId;
}

impl<F> ResolveHandler for F
where
  F: FnMut(&str, &str, ModuleId) -> ModuleId,
{
  fn resolve(
    &mut self,
    specifier: &str,
    referrer: &str,
    referrer_id: ModuleId,
  ) -> ModuleId {
    self(specifier, referrer, referrer_id)
  }
}

/// Receives `import()` requests from script. The host eventually answers
/// each one with `Isolate::dyn_import_done`.
pub trait DynamicImportHandler {
  fn dyn_import(&mut self, id: DynImportId, specifier: &str, referrer: &str);
}

impl<F> DynamicImportHandler for F
where
  F: FnMut(DynImportId, &str, &str),
{
  fn dyn_import(&mut self, id: DynImportId, specifier: &str, referrer: &str) {
    self(id, specifier, referrer)
  }
}

#[derive(Debug)]
pub(crate) struct ModuleInfo {
  pub id: ModuleId,
  pub hash: i32,
  pub main: bool,
  pub name: String,
  pub import_specifiers: Vec<String>,
  pub(crate) handle: v8::Global<v8::Module>,
  /// Set when instantiation failed. V8 leaves such modules
  /// `Uninstantiated`, the host sees them as errored.
  pub(crate) instantiate_failed: bool,
}

/// A collection of JS modules.
#[derive(Default)]
pub(crate) struct ModuleMap {
  info: HashMap<ModuleId, ModuleInfo>,
  by_name: HashMap<String, ModuleId>,
  by_hash: HashMap<i32, Vec<ModuleId>>,
  next_module_id: ModuleId,
}

impl ModuleMap {
  pub fn register(
    &mut self,
    name: &str,
    main: bool,
    handle: v8::Global<v8::Module>,
    hash: i32,
    import_specifiers: Vec<String>,
  ) -> ModuleId {
    self.next_module_id += 1;
    let id = self.next_module_id;
    log::debug!("register module {} as {}", name, id);
    self.by_name.insert(name.to_string(), id);
    self.by_hash.entry(hash).or_default().push(id);
    self.info.insert(
      id,
      ModuleInfo {
        id,
        hash,
        main,
        name: name.to_string(),
        import_specifiers,
        handle,
        instantiate_failed: false,
      },
    );
    id
  }

  pub fn get_id(&self, name: &str) -> Option<ModuleId> {
    self.by_name.get(name).copied()
  }

  pub fn get_info(&self, id: ModuleId) -> Option<&ModuleInfo> {
    self.info.get(&id)
  }

  pub fn get_info_mut(&mut self, id: ModuleId) -> Option<&mut ModuleInfo> {
    self.info.get_mut(&id)
  }

  pub fn get_handle(&self, id: ModuleId) -> Option<&v8::Global<v8::Module>> {
    self.info.get(&id).map(|i| &i.handle)
  }

  /// Looks a module up by engine identity. Colliding hashes are told apart
  /// by comparing handles.
  pub fn get_info_by_handle(
    &self,
    hash: i32,
    handle: &v8::Global<v8::Module>,
  ) -> Option<&ModuleInfo> {
    self
      .by_hash
      .get(&hash)?
      .iter()
      .filter_map(|id| self.info.get(id))
      .find(|info| &info.handle == handle)
  }

  pub fn len(&self) -> usize {
    self.info.len()
  }

  pub fn clear(&mut self) {
    self.info.clear();
    self.by_name.clear();
    self.by_hash.clear();
  }
}

pub(crate) struct DynImport {
  pub specifier: String,
  pub referrer: String,
  pub resolver: v8::Global<v8::PromiseResolver>,
}

pub(crate) struct DynImportMap {
  next_id: DynImportId,
  pub(crate) pending: HashMap<DynImportId, DynImport>,
}

impl Default for DynImportMap {
  fn default() -> Self {
    Self {
      next_id: 1,
      pending: HashMap::new(),
    }
  }
}

impl DynImportMap {
  pub fn insert(&mut self, entry: DynImport) -> DynImportId {
    let id = self.next_id;
    self.next_id += 1;
    self.pending.insert(id, entry);
    id
  }

  /// Panics if `id` was never issued or was already answered.
  pub fn take(&mut self, id: DynImportId) -> DynImport {
    match self.pending.remove(&id) {
      Some(entry) => entry,
      None => panic!("dyn_import_done called with unknown or finished id {id}"),
    }
  }
}

/// Picks the module `specifier` refers to. The resolver passed to
/// `mod_instantiate` wins over the one from the isolate config; without
/// either, specifiers are looked up by module name.
pub(crate) fn resolve(
  state_rc: &Rc<RefCell<IsolateState>>,
  specifier: &str,
  referrer: &str,
  referrer_id: ModuleId,
) -> ModuleId {
  let call_resolver = state_rc.borrow().resolver;
  if let Some(resolver) = call_resolver {
    // SAFETY: `Isolate::mod_instantiate` keeps the resolver alive and
    // clears the pointer before returning.
    let resolver = unsafe { &mut *resolver };
    let id = resolver.resolve(specifier, referrer, referrer_id);
    log::trace!("resolve {} from {} -> {}", specifier, referrer, id);
    return id;
  }

  let default_resolver = state_rc.borrow_mut().default_resolver.take();
  if let Some(mut resolver) = default_resolver {
    let id = resolver.resolve(specifier, referrer, referrer_id);
    state_rc.borrow_mut().default_resolver = Some(resolver);
    log::trace!("resolve {} from {} -> {}", specifier, referrer, id);
    return id;
  }

  state_rc.borrow().modules.get_id(specifier).unwrap_or(0)
}

/// Hands an `import()` to the host. Returns false if nobody is listening.
pub(crate) fn start_dyn_import(
  state_rc: &Rc<RefCell<IsolateState>>,
  specifier: String,
  referrer: String,
  resolver: v8::Global<v8::PromiseResolver>,
) -> bool {
  let (id, mut handler) = {
    let mut state = state_rc.borrow_mut();
    let Some(handler) = state.dyn_import_handler.take() else {
      return false;
    };
    let id = state.dyn_imports.insert(DynImport {
      specifier: specifier.clone(),
      referrer: referrer.clone(),
      resolver,
    });
    (id, handler)
  };
  log::debug!("dyn import {} {} from {}", id, specifier, referrer);
  handler.dyn_import(id, &specifier, &referrer);
  state_rc.borrow_mut().dyn_import_handler = Some(handler);
  true
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn dyn_import_ids_are_monotonic() {
    crate::flags::v8_init();
    let mut isolate = v8::Isolate::new(Default::default());
    v8::scope!(let scope, &mut isolate);
    let context = v8::Context::new(scope, Default::default());
    let scope = &mut v8::ContextScope::new(scope, context);

    let mut map = DynImportMap::default();
    let mut ids = vec![];
    for i in 0..3 {
      let resolver = v8::PromiseResolver::new(scope).unwrap();
      ids.push(map.insert(DynImport {
        specifier: format!("./{i}.js"),
        referrer: "main.js".to_string(),
        resolver: v8::Global::new(scope, resolver),
      }));
    }
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(map.take(2).specifier, "./1.js");
    assert_eq!(map.pending.len(), 2);
  }

  #[test]
  #[should_panic(expected = "unknown or finished id 9")]
  fn dyn_import_unknown_id() {
    DynImportMap::default().take(9);
  }
}
