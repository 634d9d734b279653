//! Ten band graphic equalizer
//!
//! Bands are descriptors only: center frequency, declared gain range and the
//! current gain. They live as long as the player. Each playback session
//! creates its own filter nodes from them (see `Player`), so gains survive
//! track changes.

use std::sync::atomic::{ AtomicU32, AtomicU64, Ordering };


/// Center frequencies, low to high. Filter chain order follows this order.
pub const BAND_CENTERS: [f32; BAND_COUNT] = [
    31.5, 63.0, 125.0, 250.0, 500.0, 1000.0, 2000.0, 4000.0, 8000.0, 16000.0,
];

pub const BAND_COUNT: usize = 10;

/// Linear gain that leaves the signal unmodified.
pub const GAIN_UNITY: f32 = 1.0;

/// Declared lower gain bound (about -26 dB).
pub const GAIN_MIN: f32 = 0.05;

/// Declared upper gain bound (about +9.5 dB).
pub const GAIN_MAX: f32 = 3.0;


/// One equalizer band.
#[derive( Debug )]
pub struct EqualizerBand {
    center: f32,
    min: f32,
    max: f32,
    /// f32 bits
    gain: AtomicU32,
}


impl EqualizerBand {
    fn new( center: f32 ) -> Self {
        Self {
            center,
            min: GAIN_MIN,
            max: GAIN_MAX,
            gain: AtomicU32::new( GAIN_UNITY.to_bits() ),
        }
    }


    /// Center frequency in Hz.
    pub fn center( &self ) -> f32 {
        self.center
    }


    pub fn min( &self ) -> f32 {
        self.min
    }


    pub fn max( &self ) -> f32 {
        self.max
    }


    /// Current linear gain.
    pub fn gain( &self ) -> f32 {
        f32::from_bits( self.gain.load( Ordering::Acquire ) )
    }


    /// Clamps `gain` into this band's declared range.
    pub fn clamp( &self, gain: f32 ) -> f32 {
        gain.clamp( self.min, self.max )
    }
}


/// The fixed set of bands.
///
/// Gains may be written from any thread. Readers that apply them to audio
/// state compare [`Equalizer::revision`] to know when to refresh.
#[derive( Debug )]
pub struct Equalizer {
    bands: [EqualizerBand; BAND_COUNT],
    revision: AtomicU64,
}


impl Default for Equalizer {
    fn default() -> Self {
        Self::new()
    }
}


impl Equalizer {
    pub fn new() -> Self {
        Self {
            bands: BAND_CENTERS.map( EqualizerBand::new ),
            revision: AtomicU64::new( 0 ),
        }
    }


    pub fn bands( &self ) -> &[EqualizerBand] {
        &self.bands
    }


    pub fn band( &self, index: usize ) -> Option<&EqualizerBand> {
        self.bands.get( index )
    }


    /// Sets a band gain. Out of range indices are ignored and return false.
    ///
    /// The gain is stored as given; use [`EqualizerBand::clamp`] to honour the
    /// declared range.
    pub fn set_band( &self, index: usize, gain: f32 ) -> bool {
        let Some( band ) = self.bands.get( index ) else {
            tracing::debug!( "Ignoring equalizer band {} (only {} bands)", index, BAND_COUNT );
            return false;
        };
        band.gain.store( gain.to_bits(), Ordering::Release );
        self.revision.fetch_add( 1, Ordering::AcqRel );
        true
    }


    /// Puts every band back to unity gain.
    pub fn reset( &self ) {
        for band in &self.bands {
            band.gain.store( GAIN_UNITY.to_bits(), Ordering::Release );
        }
        self.revision.fetch_add( 1, Ordering::AcqRel );
    }


    /// Current gains in band order.
    pub fn gains( &self ) -> [f32; BAND_COUNT] {
        std::array::from_fn( |i| self.bands[ i ].gain() )
    }


    /// Increments on every gain change.
    pub fn revision( &self ) -> u64 {
        self.revision.load( Ordering::Acquire )
    }
}


/// Converts a linear gain to decibels.
pub fn gain_to_db( gain: f32 ) -> f32 {
    20.0 * gain.max( f32::MIN_POSITIVE ).log10()
}


/// Q factor of a peaking filter spanning `octaves`.
pub fn bandwidth_to_q( octaves: f32 ) -> f32 {
    let n = 2f32.powf( octaves );
    n.sqrt() / ( n - 1.0 )
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_defaults() {
        let eq = Equalizer::new();
        assert_eq!( eq.bands().len(), 10 );
        assert_eq!( eq.bands()[ 0 ].center(), 31.5 );
        assert_eq!( eq.bands()[ 9 ].center(), 16000.0 );
        assert!( eq.gains().iter().all( |g| *g == GAIN_UNITY ) );
        assert_eq!( eq.revision(), 0 );
    }


    #[test]
    fn test_centers_ascend() {
        assert!( BAND_CENTERS.windows( 2 ).all( |w| w[ 0 ] < w[ 1 ] ) );
    }


    #[test]
    fn test_set_band() {
        let eq = Equalizer::new();
        assert!( eq.set_band( 3, 2.0 ) );
        assert_eq!( eq.band( 3 ).map( |b| b.gain() ), Some( 2.0 ) );
        assert_eq!( eq.revision(), 1 );
    }


    #[test]
    fn test_out_of_range_index_ignored() {
        let eq = Equalizer::new();
        eq.set_band( 2, 0.5 );
        let before = eq.gains();
        let revision = eq.revision();

        assert!( !eq.set_band( 10, 2.5 ) );
        assert!( !eq.set_band( usize::MAX, 2.5 ) );

        assert_eq!( eq.gains(), before );
        assert_eq!( eq.revision(), revision );
    }


    #[test]
    fn test_gain_not_clamped_by_setter() {
        let eq = Equalizer::new();
        eq.set_band( 0, 10.0 );
        assert_eq!( eq.gains()[ 0 ], 10.0 );
        assert_eq!( eq.bands()[ 0 ].clamp( 10.0 ), GAIN_MAX );
        assert_eq!( eq.bands()[ 0 ].clamp( 0.0 ), GAIN_MIN );
    }


    #[test]
    fn test_reset() {
        let eq = Equalizer::new();
        eq.set_band( 1, 0.2 );
        eq.set_band( 8, 2.2 );
        eq.reset();
        assert_eq!( eq.gains(), [ GAIN_UNITY; BAND_COUNT ] );
    }


    #[test]
    fn test_conversions() {
        assert!( gain_to_db( 1.0 ).abs() < 1e-6 );
        assert!( ( gain_to_db( 2.0 ) - 6.0206 ).abs() < 1e-3 );
        // One octave is the classic Q of about 1.414
        assert!( ( bandwidth_to_q( 1.0 ) - std::f32::consts::SQRT_2 ).abs() < 1e-4 );
    }
}
