/// Maps an OPC UA status code to its coarse quality label.
///
/// The two most-significant bits of a status code carry its severity:
/// `00` is Good, `01` is Uncertain, and `10` is Bad (`11` is reserved and
/// treated as Bad).
pub fn quality_label(status_code: u32) -> &'static str {
    match status_code >> 30 {
        0b00 => "Good",
        0b01 => "Uncertain",
        _ => "Bad",
    }
}

#[cfg(test)]
mod test {
    use super::quality_label;

    #[test]
    fn severity_bits_map_to_labels() {
        assert_eq!(quality_label(0), "Good"); // StatusCode::Good
        assert_eq!(quality_label(0x0000_0400), "Good"); // info bits set
        assert_eq!(quality_label(0x4000_0000), "Uncertain");
        assert_eq!(quality_label(0x8000_0000), "Bad");
        assert_eq!(quality_label(0x8033_0000), "Bad"); // BadSessionIdInvalid
        assert_eq!(quality_label(0xC000_0000), "Bad"); // reserved severity
    }
}
