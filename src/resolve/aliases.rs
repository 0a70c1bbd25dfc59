// =============================================================================
// Exchange Alias Map: requested exchange code -> ordered fallback codes
// =============================================================================
//
// Users name exchanges the way their market data vendor does; the broker has
// its own codes. The table maps common vendor names and ISO 10383 MIC codes
// onto the broker's codes, in the order the resolver should try them.
//
// Compiled into the binary. An empty chain means "no known aliases".
// =============================================================================

/// `(requested code, ordered broker codes to try)`.
const EXCHANGE_ALIASES: &[(&str, &[&str])] = &[
    // --- European venues ----------------------------------------------------
    ("XETRA", &["IBIS", "IBIS2"]),
    ("FRANKFURT", &["FWB", "IBIS"]),
    ("TRADEGATE", &["TGATE"]),
    ("STUTTGART", &["SWB"]),
    ("SWX", &["EBS"]),
    ("SIX", &["EBS"]),
    ("LONDON", &["LSE", "LSEETF"]),
    ("PARIS", &["SBF"]),
    ("EURONEXT", &["SBF", "AEB", "ENEXT.BE"]),
    ("AMSTERDAM", &["AEB"]),
    ("BRUSSELS", &["ENEXT.BE"]),
    ("MADRID", &["BM"]),
    ("BIT", &["BVME"]),
    ("MILAN", &["BVME"]),
    ("VIENNA", &["VSE"]),
    ("OMX", &["SFB"]),
    ("STOCKHOLM", &["SFB"]),
    ("COPENHAGEN", &["CPH"]),
    ("HELSINKI", &["HEX"]),
    ("OSLO", &["OSE"]),
    ("WARSAW", &["WSE"]),
    ("LISBON", &["BVL"]),
    // --- Americas -----------------------------------------------------------
    ("TSX", &["TSE"]),
    ("TORONTO", &["TSE"]),
    ("TSXV", &["VENTURE"]),
    ("NASDAQ", &["ISLAND"]),
    ("MEXICO", &["MEXI"]),
    ("SAO PAULO", &["BOVESPA"]),
    // --- Asia-Pacific -------------------------------------------------------
    // TSE is ambiguous: Tokyo for most vendors, Toronto for the broker. The
    // chain resolves the Japanese reading; Toronto is reachable via TSX.
    ("TSE", &["TSEJ"]),
    ("TOKYO", &["TSEJ"]),
    ("OSAKA", &["OSE.JPN"]),
    ("HONGKONG", &["SEHK"]),
    ("HKEX", &["SEHK"]),
    ("SINGAPORE", &["SGX"]),
    ("ASX", &["ASX"]),
    ("SYDNEY", &["ASX"]),
    ("KOREA", &["KSE"]),
    ("BSE", &["NSE"]),
    ("BOMBAY", &["NSE"]),
    ("TAIWAN", &["TWSE"]),
    // --- MIC translations (ISO 10383) --------------------------------------
    ("XNYS", &["NYSE"]),
    ("XNAS", &["NASDAQ", "ISLAND"]),
    ("XASE", &["AMEX"]),
    ("XLON", &["LSE", "LSEETF"]),
    ("XETR", &["IBIS", "IBIS2"]),
    ("XFRA", &["FWB"]),
    ("XSWX", &["EBS"]),
    ("XPAR", &["SBF"]),
    ("XAMS", &["AEB"]),
    ("XBRU", &["ENEXT.BE"]),
    ("XMAD", &["BM"]),
    ("XMIL", &["BVME"]),
    ("XWBO", &["VSE"]),
    ("XSTO", &["SFB"]),
    ("XCSE", &["CPH"]),
    ("XHEL", &["HEX"]),
    ("XOSL", &["OSE"]),
    ("XWAR", &["WSE"]),
    ("XLIS", &["BVL"]),
    ("XTSE", &["TSE"]),
    ("XTSX", &["VENTURE"]),
    ("XMEX", &["MEXI"]),
    ("XBSP", &["BOVESPA"]),
    ("XTKS", &["TSEJ"]),
    ("XHKG", &["SEHK"]),
    ("XSES", &["SGX"]),
    ("XASX", &["ASX"]),
    ("XKRX", &["KSE"]),
    ("XNSE", &["NSE"]),
    ("XBOM", &["NSE"]),
    ("XTAI", &["TWSE"]),
];

/// Ordered fallback codes for `requested`. Case-insensitive; empty when the
/// code has no known aliases.
pub fn alias_chain(requested: &str) -> &'static [&'static str] {
    let upper = requested.to_ascii_uppercase();
    EXCHANGE_ALIASES
        .iter()
        .find(|(code, _)| *code == upper)
        .map(|(_, chain)| *chain)
        .unwrap_or(&[])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn required_aliases_present() {
        assert_eq!(alias_chain("XETRA"), &["IBIS", "IBIS2"]);
        assert_eq!(alias_chain("TRADEGATE"), &["TGATE"]);
        assert_eq!(alias_chain("SWX"), &["EBS"]);
        assert_eq!(alias_chain("TSX"), &["TSE"]);
        assert_eq!(alias_chain("BIT"), &["BVME"]);
        assert_eq!(alias_chain("BSE"), &["NSE"]);
        assert_eq!(alias_chain("TSE"), &["TSEJ"]);
        assert_eq!(alias_chain("OMX"), &["SFB"]);
    }

    #[test]
    fn mic_translations_present() {
        assert_eq!(alias_chain("XNYS"), &["NYSE"]);
        assert_eq!(alias_chain("XLON"), &["LSE", "LSEETF"]);
        assert_eq!(alias_chain("XTKS"), &["TSEJ"]);
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(alias_chain("xetra"), &["IBIS", "IBIS2"]);
    }

    #[test]
    fn unknown_codes_have_empty_chains() {
        assert!(alias_chain("NYSE").is_empty());
        assert!(alias_chain("NOWHERE").is_empty());
    }

    #[test]
    fn no_duplicate_requested_codes() {
        for (i, (code, _)) in EXCHANGE_ALIASES.iter().enumerate() {
            for (other, _) in &EXCHANGE_ALIASES[i + 1..] {
                assert_ne!(code, other, "duplicate alias entry {code}");
            }
        }
    }
}
