#![no_main]

use libfuzzer_sys::fuzz_target;
use tk_stats::{InstanceAccumulator, StatExtractor};
use tk_types::StatPath;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let paths = [
        StatPath::new(["index"]),
        StatPath::new(["filter", "global"]),
        StatPath::new(["filter", "rounds"]),
        StatPath::new(["heap peak"]),
    ];
    let Ok(extractor) = StatExtractor::new(&paths) else {
        return;
    };
    let stats = extractor.extract(text);
    let mut accumulator = InstanceAccumulator::new();
    accumulator.add_run(&stats);
    accumulator.add_run(&stats);
    let _ = accumulator.finish();
});
