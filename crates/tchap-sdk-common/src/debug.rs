// Copyright 2022 The Matrix.org Foundation C.I.C.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Helpers for creating `std::fmt::Debug` implementations.

use std::fmt;

use serde_json::Value as JsonValue;

pub trait DebugStructExt<'a, 'b> {
    /// Add a field only if the value is `Some`.
    fn maybe_field<T: fmt::Debug>(&mut self, name: &str, value: &Option<T>) -> &mut Self;
}

impl<'a, 'b> DebugStructExt<'a, 'b> for fmt::DebugStruct<'a, 'b> {
    fn maybe_field<T: fmt::Debug>(&mut self, name: &str, value: &Option<T>) -> &mut Self {
        if let Some(value) = value {
            self.field(name, value);
        }

        self
    }
}

/// A wrapper around an event content that implements `Debug` in a way that
/// only prints the top-level keys, never the values.
///
/// Message bodies are user data and must not end up in logs.
pub struct DebugJsonContent<'a>(pub &'a JsonValue);

#[cfg(not(tarpaulin_include))]
impl fmt::Debug for DebugJsonContent<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            JsonValue::Object(map) => f.debug_set().entries(map.keys()).finish(),
            JsonValue::Null => f.write_str("null"),
            _ => f.write_str("<non-object content>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{DebugJsonContent, DebugStructExt};

    #[test]
    fn test_debug_content_hides_values() {
        let content = json!({ "body": "secret", "msgtype": "m.text" });
        let printed = format!("{:?}", DebugJsonContent(&content));

        assert!(printed.contains("body"));
        assert!(!printed.contains("secret"));
    }

    #[test]
    fn test_maybe_field() {
        struct Foo {
            a: Option<u8>,
            b: Option<u8>,
        }

        impl std::fmt::Debug for Foo {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.debug_struct("Foo").maybe_field("a", &self.a).maybe_field("b", &self.b).finish()
            }
        }

        assert_eq!(format!("{:?}", Foo { a: Some(1), b: None }), "Foo { a: 1 }");
    }
}
