/// For narrowing casts of lengths where earlier validation ensures that the value fits the wire
///  field, e.g. a collector domain that was checked against `u16::MAX` in the config.
/// NB: The implementations panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: length was not checked against the u32 wire field")
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: length was not checked against the u16 wire field")
    }
}

/// Narrowing casts that clamp to the target type's range, for wire fields that have a smaller
///  range than the values they represent (timestamps before 1970 or after 2106)
pub trait SaturatingCast<T> {
    fn saturating_cast(self) -> T;
}
impl SaturatingCast<u32> for i64 {
    fn saturating_cast(self) -> u32 {
        self.clamp(0, u32::MAX as i64) as u32
    }
}
impl SaturatingCast<i16> for i32 {
    fn saturating_cast(self) -> i16 {
        self.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0)]
    #[case(65535)]
    #[case(u32::MAX as usize)]
    fn test_prechecked_u32(#[case] value: usize) {
        let narrowed: u32 = value.prechecked_cast();
        assert_eq!(narrowed as usize, value);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_u16_out_of_range() {
        let _: u16 = 65536usize.prechecked_cast();
    }

    #[rstest]
    #[case::negative(-1, 0)]
    #[case::zero(0, 0)]
    #[case::in_range(1551441600, 1551441600)]
    #[case::max(u32::MAX as i64, u32::MAX)]
    #[case::beyond(u32::MAX as i64 + 1, u32::MAX)]
    fn test_saturating_u32(#[case] value: i64, #[case] expected: u32) {
        assert_eq!(SaturatingCast::<u32>::saturating_cast(value), expected);
    }

    #[rstest]
    #[case::in_range(-60, -60)]
    #[case::too_small(-40_000, i16::MIN)]
    #[case::too_large(40_000, i16::MAX)]
    fn test_saturating_i16(#[case] value: i32, #[case] expected: i16) {
        assert_eq!(SaturatingCast::<i16>::saturating_cast(value), expected);
    }
}
