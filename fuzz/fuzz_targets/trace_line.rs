#![no_main]

use libfuzzer_sys::fuzz_target;
use procprov::filter::ArgvMatcher;
use procprov::parser::TraceParser;
use procprov::reduce::reduce;

fuzz_target!(|data: &[u8]| {
    // Any byte stream may be rejected, but must never panic
    let text = String::from_utf8_lossy(data);
    let mut parser = TraceParser::new("/work");
    for line in text.lines() {
        if parser.feed_line(line).is_err() {
            return;
        }
    }
    let _ = reduce(parser.finish(), &ArgvMatcher::all());
});
