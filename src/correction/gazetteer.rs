//! Built-in target phrases: vehicle registration metro prefixes followed by
//! district names

pub const DISTRICT_GAZETTEER: &[&str] = &[
    "ঢাকা মেট্রো",
    "চট্ট মেট্রো",
    "রাজ মেট্রো",
    "সিলেট মেট্রো",
    "খুলনা মেট্রো",
    "বরিশাল মেট্রো",
    "ঢাকা",
    "চট্টগ্রাম",
    "রাজশাহী",
    "খুলনা",
    "বরিশাল",
    "সিলেট",
    "রংপুর",
    "ময়মনসিংহ",
    "কুমিল্লা",
    "নরসিংদী",
    "ফরিদপুর",
    "দিনাজপুর",
    "ভোলা",
    "নোয়াখালী",
    "কক্সবাজার",
    "বগুড়া",
    "সাতক্ষীরা",
    "নাটোর",
    "টাঙ্গাইল",
    "গাজীপুর",
    "ফেনী",
    "ঝিনাইদহ",
    "লক্ষ্মীপুর",
    "ঝালকাঠি",
    "পিরোজপুর",
    "ব্রাহ্মণবাড়িয়া",
    "শরীয়তপুর",
    "জয়পুরহাট",
    "নওগাঁ",
    "চাঁপাইনবাবগঞ্জ",
    "কুড়িগ্রাম",
    "ঠাকুরগাঁও",
    "পঞ্চগড়",
    "সিরাজগঞ্জ",
    "রাজবাড়ী",
    "কিশোরগঞ্জ",
    "গোপালগঞ্জ",
    "মেহেরপুর",
    "চুয়াডাঙ্গা",
    "মাদারীপুর",
];

/// The built-in gazetteer as owned strings
pub fn default_targets() -> Vec<String> {
    DISTRICT_GAZETTEER.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gazetteer_entries_are_unique() {
        let mut entries = default_targets();
        let total = entries.len();
        entries.sort();
        entries.dedup();
        assert_eq!(entries.len(), total);
        assert_eq!(total, 46);
    }
}
