// Copyright (c) 2025 the sensormux contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//
#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sensormux_core::registry::SensorRegistry;
use sensormux_core::sensor::SensorDescriptor;
use sensormux_core::types;

#[derive(Debug, Arbitrary)]
enum Op {
    Add { handle: i32, debug: bool, device_id: i32 },
    Remove { handle: i32 },
    Lookup { handle: i32 },
}

fuzz_target!(|ops: Vec<Op>| {
    let mut registry = SensorRegistry::new();
    let mut ever_accepted = std::collections::HashSet::new();

    for op in ops {
        match op {
            Op::Add { handle, debug, device_id } => {
                let descriptor =
                    SensorDescriptor::new(handle, types::TYPE_ACCELEROMETER, "fuzzed");
                if registry.add(descriptor, debug, false, device_id) {
                    // A handle is accepted at most once per process lifetime.
                    assert!(ever_accepted.insert(handle));
                }
            }
            Op::Remove { handle } => {
                let removed = registry.remove(handle);
                if removed {
                    assert!(!registry.is_new_handle(handle));
                }
            }
            Op::Lookup { handle } => {
                if let Some(entry) = registry.lookup(handle) {
                    assert_eq!(entry.descriptor.handle, handle);
                }
            }
        }
    }
});
