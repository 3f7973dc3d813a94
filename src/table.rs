use crate::objects::object::Object;
use crate::objects::object_string::ObjectString;
use crate::value::{is_nil, make_bool_value, make_nil_value, Value};

// Open addressing with linear probing. Keys are interned strings, so key
// comparison is pointer identity. A tombstone is a null key with a `true`
// value; a truly empty slot is a null key with a nil value. `count` includes
// tombstones so the load factor accounts for them.
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

#[derive(Clone, Copy)]
pub struct Entry {
    pub key: *mut ObjectString,
    pub value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: std::ptr::null_mut(),
            value: make_nil_value(),
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_null() && !is_nil(&self.value)
    }
}

fn grow_capacity(capacity: usize) -> usize {
    if capacity < 8 {
        8
    } else {
        capacity * 2
    }
}

// Index of the matching entry, or of the slot an insertion should use: the
// first tombstone on the probe path if any, otherwise the empty slot that
// ended the probe.
fn find_entry(entries: &[Entry], key: *mut ObjectString) -> usize {
    let capacity = entries.len();
    let mut index = unsafe { (*key).hash } as usize % capacity;
    let mut tombstone: Option<usize> = None;

    loop {
        let entry = &entries[index];
        if entry.key.is_null() {
            if is_nil(&entry.value) {
                return tombstone.unwrap_or(index);
            }
            if tombstone.is_none() {
                tombstone = Some(index);
            }
        } else if entry.key == key {
            return index;
        }

        index = (index + 1) % capacity;
    }
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of live (non-tombstone) entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|entry| !entry.key.is_null()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old_entries = std::mem::replace(&mut self.entries, vec![Entry::empty(); capacity]);
        self.count = 0;
        for entry in old_entries {
            if entry.key.is_null() {
                continue;
            }
            let index = find_entry(&self.entries, entry.key);
            self.entries[index] = entry;
            self.count += 1;
        }
    }

    /// Insert or update. Returns true iff the key was not present before.
    pub fn set(&mut self, key: *mut ObjectString, value: Value) -> bool {
        if 4 * (self.count + 1) > 3 * self.entries.len() {
            let capacity = grow_capacity(self.entries.len());
            self.adjust_capacity(capacity);
        }

        let index = find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new_key = entry.key.is_null();
        if is_new_key && is_nil(&entry.value) {
            self.count += 1;
        }

        entry.key = key;
        entry.value = value;
        is_new_key
    }

    pub fn get(&self, key: *mut ObjectString) -> Option<Value> {
        if self.count == 0 {
            return None;
        }

        let index = find_entry(&self.entries, key);
        let entry = &self.entries[index];
        if entry.key.is_null() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Replace the entry with a tombstone so probe sequences stay intact.
    pub fn delete(&mut self, key: *mut ObjectString) -> bool {
        if self.count == 0 {
            return false;
        }

        let index = find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }

        entry.key = std::ptr::null_mut();
        entry.value = make_bool_value(true);
        true
    }

    /// Deep lookup by content, used by the intern layer before a string
    /// object exists. Tombstones do not end the probe; empty slots do.
    pub fn find_string(&self, content: &str, hash: u32) -> Option<*mut ObjectString> {
        if self.count == 0 {
            return None;
        }

        let capacity = self.entries.len();
        let mut index = hash as usize % capacity;
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if !entry.is_tombstone() {
                    return None;
                }
            } else {
                let key = unsafe { &*entry.key };
                if key.hash == hash
                    && key.content.len() == content.len()
                    && key.content == content
                {
                    return Some(entry.key);
                }
            }

            index = (index + 1) % capacity;
        }
    }

    /// Drop every entry whose key the collector did not reach. Run between
    /// trace and sweep so unreachable interned strings can be freed.
    pub fn remove_white(&mut self, is_marked: impl Fn(*mut Object) -> bool) {
        let stale: Vec<*mut ObjectString> = self
            .entries
            .iter()
            .filter(|entry| !entry.key.is_null() && !is_marked(entry.key as *mut Object))
            .map(|entry| entry.key)
            .collect();
        for key in stale {
            self.delete(key);
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut ObjectString, Value)> + '_ {
        self.entries
            .iter()
            .filter(|entry| !entry.key.is_null())
            .map(|entry| (entry.key, entry.value))
    }
}
