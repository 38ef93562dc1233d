//! Indexed per-connection attribute storage.
//!
//! Attributes give filters O(1) scratch state on a connection without the
//! filters knowing about each other. An [`Attribute`] is a typed handle with
//! a process-wide dense index assigned once by the [`AttributeBuilder`];
//! every [`AttributeHolder`] is a plain slot array addressed by that index.
//!
//! Registration takes a lock; slot access after registration is lock-free
//! because the handle caches its index.

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, OnceLock};

/// Process-wide attribute registrar and index allocator.
pub struct AttributeBuilder {
    inner: Mutex<BuilderInner>,
}

#[derive(Default)]
struct BuilderInner {
    names: Vec<String>,
    by_name: HashMap<String, usize>,
}

static DEFAULT_BUILDER: OnceLock<AttributeBuilder> = OnceLock::new();

/// The default process-wide builder used by the transport and the bundled
/// filters.
pub fn default_attribute_builder() -> &'static AttributeBuilder {
    DEFAULT_BUILDER.get_or_init(AttributeBuilder::new)
}

impl AttributeBuilder {
    pub fn new() -> Self {
        Self { inner: Mutex::new(BuilderInner::default()) }
    }

    /// Registers (or looks up) `name` and returns a typed handle for it.
    ///
    /// Registering the same name twice yields handles with the same index.
    pub fn attribute<T: Any + Send + Sync>(&self, name: &str) -> Attribute<T> {
        self.build(name, None)
    }

    /// Like [`attribute`](Self::attribute), with a lazy initializer used by
    /// [`Attribute::get_or_insert`].
    pub fn attribute_with<T, F>(&self, name: &str, init: F) -> Attribute<T>
    where
        T: Any + Send + Sync,
        F: Fn() -> T + Send + Sync + 'static,
    {
        self.build(name, Some(Arc::new(init)))
    }

    fn build<T: Any + Send + Sync>(&self, name: &str, init: Option<Arc<dyn Fn() -> T + Send + Sync>>) -> Attribute<T> {
        let mut inner = self.inner.lock().unwrap();
        let index = match inner.by_name.get(name) {
            Some(&index) => index,
            None => {
                let index = inner.names.len();
                inner.names.push(name.to_owned());
                inner.by_name.insert(name.to_owned(), index);
                index
            }
        };
        Attribute { index, name: Arc::from(name), init, _marker: PhantomData }
    }

    /// Resolves a registered index back to its name.
    pub fn name_of(&self, index: usize) -> Option<String> {
        self.inner.lock().unwrap().names.get(index).cloned()
    }
}

impl Default for AttributeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Typed handle to one attribute slot.
pub struct Attribute<T> {
    index: usize,
    name: Arc<str>,
    init: Option<Arc<dyn Fn() -> T + Send + Sync>>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Attribute<T> {
    fn clone(&self) -> Self {
        Self { index: self.index, name: self.name.clone(), init: self.init.clone(), _marker: PhantomData }
    }
}

impl<T: Any + Send + Sync> Attribute<T> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get<'a>(&self, holder: &'a AttributeHolder) -> Option<&'a T> {
        holder.get_raw(self.index)?.downcast_ref()
    }

    pub fn get_mut<'a>(&self, holder: &'a mut AttributeHolder) -> Option<&'a mut T> {
        holder.get_raw_mut(self.index)?.downcast_mut()
    }

    pub fn set(&self, holder: &mut AttributeHolder, value: T) {
        holder.set_raw(self.index, Box::new(value));
    }

    /// Removes and returns the slot value. The slot stays allocated.
    pub fn remove(&self, holder: &mut AttributeHolder) -> Option<T> {
        let boxed = holder.remove_raw(self.index)?;
        boxed.downcast().ok().map(|b| *b)
    }

    /// Moves the value out of the holder, leaving the slot empty.
    ///
    /// The take/put-back pattern lets a filter own its state across `await`
    /// points while the holder is borrowed elsewhere.
    pub fn take(&self, holder: &mut AttributeHolder) -> Option<T> {
        self.remove(holder)
    }

    /// Returns the slot value, constructing it with the registered
    /// initializer on first access.
    ///
    /// # Panics
    ///
    /// Panics if the attribute was registered without an initializer.
    pub fn get_or_insert<'a>(&self, holder: &'a mut AttributeHolder) -> &'a mut T {
        let init = self.init.as_ref().expect("attribute registered without initializer");
        if self.get(holder).is_none() {
            holder.set_raw(self.index, Box::new(init()));
        }
        self.get_mut(holder).unwrap()
    }
}

/// Dense slot array attached to a connection.
///
/// Not thread-safe: mutation happens only on the connection's owning task.
#[derive(Default)]
pub struct AttributeHolder {
    values: Vec<Option<Box<dyn Any + Send + Sync>>>,
}

impl AttributeHolder {
    pub fn new() -> Self {
        Default::default()
    }

    fn get_raw(&self, index: usize) -> Option<&(dyn Any + Send + Sync)> {
        self.values.get(index)?.as_deref()
    }

    fn get_raw_mut(&mut self, index: usize) -> Option<&mut (dyn Any + Send + Sync)> {
        self.values.get_mut(index)?.as_deref_mut()
    }

    fn set_raw(&mut self, index: usize, value: Box<dyn Any + Send + Sync>) {
        if index >= self.values.len() {
            self.values.resize_with(index + 1, || None);
        }
        self.values[index] = Some(value);
    }

    fn remove_raw(&mut self, index: usize) -> Option<Box<dyn Any + Send + Sync>> {
        self.values.get_mut(index)?.take()
    }

    /// Drops every stored value and truncates the slot array.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    /// Names of the attributes currently set, resolved through `builder`.
    pub fn names(&self, builder: &AttributeBuilder) -> Vec<String> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| v.is_some())
            .filter_map(|(i, _)| builder.name_of(i))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|v| v.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_name_same_index() {
        let builder = AttributeBuilder::new();
        let a: Attribute<u32> = builder.attribute("alpha");
        let b: Attribute<u32> = builder.attribute("beta");
        let a_again: Attribute<u32> = builder.attribute("alpha");

        assert_eq!(a.index(), a_again.index());
        assert_ne!(a.index(), b.index());
    }

    #[test]
    fn set_get_remove_roundtrip() {
        let builder = AttributeBuilder::new();
        let attr: Attribute<String> = builder.attribute("greeting");
        let mut holder = AttributeHolder::new();

        assert!(attr.get(&holder).is_none());

        attr.set(&mut holder, "hello".to_owned());
        assert_eq!(attr.get(&holder).map(String::as_str), Some("hello"));

        assert_eq!(attr.remove(&mut holder), Some("hello".to_owned()));
        assert!(attr.get(&holder).is_none());
        // the slot stays allocated, the value is gone
        assert!(holder.is_empty());
    }

    #[test]
    fn out_of_range_get_is_none_and_set_grows() {
        let builder = AttributeBuilder::new();
        let _pad: Attribute<u8> = builder.attribute("pad-0");
        let far: Attribute<u8> = builder.attribute("pad-1");
        let mut holder = AttributeHolder::new();

        assert!(far.get(&holder).is_none());
        far.set(&mut holder, 7);
        assert_eq!(far.get(&holder), Some(&7));
    }

    #[test]
    fn get_or_insert_uses_initializer_once() {
        let builder = AttributeBuilder::new();
        let attr: Attribute<Vec<u8>> = builder.attribute_with("scratch", || vec![1, 2, 3]);
        let mut holder = AttributeHolder::new();

        attr.get_or_insert(&mut holder).push(4);
        assert_eq!(attr.get(&holder), Some(&vec![1, 2, 3, 4]));

        attr.get_or_insert(&mut holder).push(5);
        assert_eq!(attr.get(&holder), Some(&vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn clear_truncates_and_names_resolve() {
        let builder = AttributeBuilder::new();
        let a: Attribute<u32> = builder.attribute("first");
        let b: Attribute<u32> = builder.attribute("second");
        let mut holder = AttributeHolder::new();

        a.set(&mut holder, 1);
        b.set(&mut holder, 2);

        let mut names = holder.names(&builder);
        names.sort();
        assert_eq!(names, vec!["first".to_owned(), "second".to_owned()]);

        holder.clear();
        assert!(holder.is_empty());
        assert!(holder.names(&builder).is_empty());
    }
}
