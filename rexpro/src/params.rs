// Copyright 2024 Google LLC
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

use rmpv::Value;

use crate::error::{Error, Result};

/// Parameter bindings for a script request.
///
/// Names must be valid script identifiers and values must be text,
/// integers, floats, or sequences; both are checked client side before
/// any bytes go out on the wire.
///
/// ```
/// use rexpro::Params;
///
/// let params = Params::new().set("values", 5).set("name", "titan");
/// ```
#[derive(Debug, Clone, Default)]
pub struct Params(Vec<(String, Value)>);

impl Params {
    pub fn new() -> Params {
        Params(Vec::new())
    }

    /// Bind a value to a name, consuming and returning self so bindings
    /// chain.
    pub fn set<N, V>(mut self, name: N, value: V) -> Params
    where
        N: Into<String>,
        V: Into<Value>,
    {
        self.0.push((name.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Check every binding against the naming and type rules.
    pub(crate) fn validate(&self) -> Result<()> {
        for (name, value) in &self.0 {
            if name.starts_with(|c: char| c.is_ascii_digit()) {
                return Err(Error::Script(String::from(
                    "parameter names can't begin with a number",
                )));
            }
            if name.contains(|c: char| c.is_whitespace() || c == '.') {
                return Err(Error::Script(format!(
                    "parameter names can't contain whitespace or dots: {name:?}"
                )));
            }
            if !supported_value(value) {
                return Err(Error::Script(format!(
                    "{} is an unsupported parameter type",
                    kind_name(value)
                )));
            }
        }
        Ok(())
    }

    pub(crate) fn into_value(self) -> Value {
        Value::Map(self.0.into_iter().map(|(k, v)| (Value::String(k.into()), v)).collect())
    }
}

fn supported_value(value: &Value) -> bool {
    // the kind check is top-level only: any sequence passes, whatever
    // its elements hold
    matches!(
        value,
        Value::String(_) | Value::Integer(_) | Value::F32(_) | Value::F64(_) | Value::Array(_)
    )
}

fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Nil => "nil",
        Value::Boolean(_) => "boolean",
        Value::Integer(_) => "integer",
        Value::F32(_) | Value::F64(_) => "float",
        Value::String(_) => "string",
        Value::Binary(_) => "binary",
        Value::Array(_) => "array",
        Value::Map(_) => "map",
        Value::Ext(..) => "ext",
    }
}
