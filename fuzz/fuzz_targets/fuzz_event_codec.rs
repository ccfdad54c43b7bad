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

use libfuzzer_sys::fuzz_target;
use sensormux_core::event;

fuzz_target!(|data: &[u8]| {
    // Arbitrary wire bytes must never panic the decoder.
    if let Some(decoded) = event::decode(data) {
        // Anything the decoder accepts must survive re-encoding.
        let encoded = event::encode(&decoded);
        let again = event::decode(&encoded).expect("re-decode of an encoded event");
        assert_eq!(again.sensor, decoded.sensor);
        assert_eq!(again.event_type, decoded.event_type);
        assert_eq!(again.timestamp_ns, decoded.timestamp_ns);
        assert_eq!(again.flags, decoded.flags);
    }
});
