#![no_main]

use libfuzzer_sys::fuzz_target;
use usbirp::descriptors::{configurations, DescriptorRecord, Descriptors};

fuzz_target!(|data: &[u8]| {
    if let Ok(record) = DescriptorRecord::decode(data) {
        let encoded = record.encode();
        assert_eq!(DescriptorRecord::decode(&encoded).as_ref(), Ok(&record));
    }

    for desc in Descriptors::new(data) {
        std::hint::black_box(desc.decode().ok());
    }

    for config in configurations(data) {
        let s = format!("{config:?}");
        std::hint::black_box(s);
    }
});
