// Copyright 2019 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Diagnostic inspection of live protocol objects.
//!
//! An [`Inspectable`] object reports its state as a flat sequence of named
//! values to an [`Inspector`] sink. The crate ships one sink,
//! [`LogInspector`], which writes each field through the `log` facade;
//! tooling can provide richer sinks without the objects changing.

/// Receives the fields an [`Inspectable`] object reports.
pub trait Inspector {
    /// Opens a named sub-object.
    fn on_object_start(&mut self, name: &str);

    /// Closes the most recently opened sub-object.
    fn on_object_end(&mut self);

    /// Reports one unsigned integer field.
    fn on_uint(&mut self, name: &str, value: u64);

    /// Reports one string field.
    fn on_str(&mut self, name: &str, value: &str);

    /// Reports one boolean field.
    fn on_bool(&mut self, name: &str, value: bool);
}

/// Objects that can report their diagnostic state.
pub trait Inspectable {
    /// Reports this object's state to `inspector`.
    fn inspect(&self, inspector: &mut dyn Inspector);
}

/// An [`Inspector`] that writes each field through the `log` facade at
/// debug level.
#[derive(Debug, Default)]
pub struct LogInspector {
    depth: usize,
}

impl LogInspector {
    fn indent(&self) -> String {
        "  ".repeat(self.depth)
    }
}

impl Inspector for LogInspector {
    fn on_object_start(&mut self, name: &str) {
        log::debug!("{}{}:", self.indent(), name);
        self.depth += 1;
    }

    fn on_object_end(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    fn on_uint(&mut self, name: &str, value: u64) {
        log::debug!("{}{} = {}", self.indent(), name, value);
    }

    fn on_str(&mut self, name: &str, value: &str) {
        log::debug!("{}{} = {:?}", self.indent(), name, value);
    }

    fn on_bool(&mut self, name: &str, value: bool) {
        log::debug!("{}{} = {}", self.indent(), name, value);
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Records inspection output as flat `path = value` strings.
    #[derive(Debug, Default)]
    pub struct RecordingInspector {
        pub path: Vec<String>,
        pub fields: Vec<(String, String)>,
    }

    impl RecordingInspector {
        fn record(&mut self, name: &str, value: String) {
            let mut key = self.path.join(".");
            if !key.is_empty() {
                key.push('.');
            }
            key.push_str(name);
            self.fields.push((key, value));
        }

        pub fn get(&self, key: &str) -> Option<&str> {
            self.fields
                .iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.as_str())
        }
    }

    impl Inspector for RecordingInspector {
        fn on_object_start(&mut self, name: &str) {
            self.path.push(name.to_string());
        }

        fn on_object_end(&mut self) {
            self.path.pop();
        }

        fn on_uint(&mut self, name: &str, value: u64) {
            self.record(name, value.to_string());
        }

        fn on_str(&mut self, name: &str, value: &str) {
            self.record(name, value.to_string());
        }

        fn on_bool(&mut self, name: &str, value: bool) {
            self.record(name, value.to_string());
        }
    }
}
