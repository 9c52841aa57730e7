#![no_main]

use libfuzzer_sys::fuzz_target;
use tk_validate::validate_ranking_outputs;

fuzz_target!(|data: &[u8]| {
    let Ok(text) = std::str::from_utf8(data) else {
        return;
    };
    let (unit, witness) = text.split_once('\n').unwrap_or((text, text));
    let _ = validate_ranking_outputs(unit, witness);
    // A well-formed output always agrees with itself.
    if validate_ranking_outputs(unit, unit).is_err() {
        assert!(tk_validate::parse_ranking_output(unit, tk_validate::Side::Unit).is_err());
    }
});
