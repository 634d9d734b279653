//! Filter nodes and per-channel filter chains for the native backend.

use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicU32, Ordering };

use biquad::{ Biquad, Coefficients, DirectForm1, ToHertz, Type };
use parking_lot::Mutex;

use super::DspProcessor;
use crate::equalizer::{ bandwidth_to_q, gain_to_db };


/// Peaking EQ biquad, one filter state per channel.
pub struct ParamEqFilter {
    center: f32,
    q: f32,
    sample_rate: u32,
    /// f32 bits, shared with the handle so gain changes reach the audio thread
    gain: Arc<AtomicU32>,
    applied_gain: Option<f32>,
    states: Vec<DirectForm1<f32>>,
    bypass: bool,
}


impl ParamEqFilter {
    /// Coefficients assume 48 kHz until the filter is attached to a channel.
    pub fn new( center: f32, bandwidth: f32, gain: f32 ) -> Self {
        Self {
            center,
            q: bandwidth_to_q( bandwidth ),
            sample_rate: 48000,
            gain: Arc::new( AtomicU32::new( gain.to_bits() ) ),
            applied_gain: None,
            states: Vec::new(),
            bypass: false,
        }
    }


    /// Handle used to change the gain while the filter is running.
    pub fn gain_handle( &self ) -> Arc<AtomicU32> {
        Arc::clone( &self.gain )
    }


    fn coefficients( &self, gain: f32 ) -> Option<Coefficients<f32>> {
        Coefficients::<f32>::from_params(
            Type::PeakingEQ( gain_to_db( gain ) ),
            ( self.sample_rate as f32 ).hz(),
            self.center.hz(),
            self.q,
        ).ok()
    }


    /// Rebuilds coefficients when the gain or the channel layout changed.
    fn refresh( &mut self, channels: usize ) {
        let gain = f32::from_bits( self.gain.load( Ordering::Relaxed ) );
        if self.applied_gain == Some( gain ) && self.states.len() == channels {
            return;
        }
        match self.coefficients( gain ) {
            Some( coeffs ) => {
                self.bypass = false;
                if self.states.len() == channels {
                    for state in &mut self.states {
                        state.update_coefficients( coeffs );
                    }
                } else {
                    self.states = ( 0..channels ).map( |_| DirectForm1::<f32>::new( coeffs ) ).collect();
                }
            }
            // Band above Nyquist for this device rate
            None => self.bypass = true,
        }
        self.applied_gain = Some( gain );
    }
}


impl DspProcessor for ParamEqFilter {
    fn set_sample_rate( &mut self, sample_rate: u32 ) {
        if sample_rate != self.sample_rate {
            self.sample_rate = sample_rate;
            self.applied_gain = None;
            self.states.clear();
        }
    }


    fn process( &mut self, input: &[f32], output: &mut [f32], channels: usize ) {
        if channels == 0 {
            output.copy_from_slice( input );
            return;
        }
        self.refresh( channels );
        if self.bypass {
            output.copy_from_slice( input );
            return;
        }
        for ( frame_in, frame_out ) in input.chunks( channels ).zip( output.chunks_mut( channels ) ) {
            for ( ch, ( x, y ) ) in frame_in.iter().zip( frame_out.iter_mut() ).enumerate() {
                *y = self.states[ ch ].run( *x );
            }
        }
    }
}


/// A filter owned by the native system and possibly attached to a channel.
pub( crate ) struct FilterNode {
    dsp: Mutex<Box<dyn DspProcessor>>,
    gain: Option<Arc<AtomicU32>>,
    released: AtomicBool,
}


impl FilterNode {
    pub( crate ) fn new( dsp: Box<dyn DspProcessor>, gain: Option<Arc<AtomicU32>> ) -> Arc<Self> {
        Arc::new( Self {
            dsp: Mutex::new( dsp ),
            gain,
            released: AtomicBool::new( false ),
        })
    }


    pub( crate ) fn set_gain( &self, gain: f32 ) {
        if let Some( ref g ) = self.gain {
            g.store( gain.to_bits(), Ordering::Relaxed );
        }
    }


    /// Tells the DSP the rate of the channel it is about to join.
    pub( crate ) fn prepare( &self, sample_rate: u32 ) {
        self.dsp.lock().set_sample_rate( sample_rate );
    }


    pub( crate ) fn release( &self ) {
        self.released.store( true, Ordering::Release );
    }


    pub( crate ) fn is_released( &self ) -> bool {
        self.released.load( Ordering::Acquire )
    }
}


/// Ordered filters of one channel, run in the output callback.
#[derive( Default )]
pub( crate ) struct FilterChain {
    nodes: Vec<Arc<FilterNode>>,
    scratch: Vec<f32>,
}


impl FilterChain {
    pub( crate ) fn push( &mut self, node: Arc<FilterNode> ) {
        self.nodes.retain( |n| !n.is_released() );
        self.nodes.push( node );
    }


    pub( crate ) fn len( &self ) -> usize {
        self.nodes.iter().filter( |n| !n.is_released() ).count()
    }


    /// Runs `buffer` through every live node, in order.
    pub( crate ) fn process( &mut self, buffer: &mut [f32], channels: usize ) {
        for node in &self.nodes {
            if node.is_released() {
                continue;
            }
            self.scratch.clear();
            self.scratch.extend_from_slice( buffer );
            node.dsp.lock().process( &self.scratch, buffer, channels );
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    struct Gain( f32 );

    impl DspProcessor for Gain {
        fn process( &mut self, input: &[f32], output: &mut [f32], _channels: usize ) {
            for ( x, y ) in input.iter().zip( output.iter_mut() ) {
                *y = x * self.0;
            }
        }
    }


    struct Offset( f32 );

    impl DspProcessor for Offset {
        fn process( &mut self, input: &[f32], output: &mut [f32], _channels: usize ) {
            for ( x, y ) in input.iter().zip( output.iter_mut() ) {
                *y = x + self.0;
            }
        }
    }


    #[test]
    fn test_chain_runs_in_order() {
        let mut chain = FilterChain::default();
        chain.push( FilterNode::new( Box::new( Gain( 2.0 ) ), None ) );
        chain.push( FilterNode::new( Box::new( Offset( 1.0 ) ), None ) );

        let mut buffer = vec![ 1.0, 2.0 ];
        chain.process( &mut buffer, 1 );
        // (x * 2) + 1, not (x + 1) * 2
        assert_eq!( buffer, vec![ 3.0, 5.0 ] );
    }


    #[test]
    fn test_released_node_is_skipped() {
        let mut chain = FilterChain::default();
        let node = FilterNode::new( Box::new( Gain( 0.0 ) ), None );
        chain.push( Arc::clone( &node ) );
        node.release();

        let mut buffer = vec![ 0.5, 0.25 ];
        chain.process( &mut buffer, 2 );
        assert_eq!( buffer, vec![ 0.5, 0.25 ] );
        assert_eq!( chain.len(), 0 );
    }


    #[test]
    fn test_unity_peaking_filter_is_transparent() {
        let mut eq = ParamEqFilter::new( 1000.0, 1.0, 1.0 );
        let input: Vec<f32> = ( 0..256 ).map( |i| ( i as f32 * 0.1 ).sin() ).collect();
        let mut output = vec![ 0.0; 256 ];
        eq.process( &input, &mut output, 2 );
        for ( x, y ) in input.iter().zip( &output ) {
            assert!( ( x - y ).abs() < 1e-4 );
        }
    }


    #[test]
    fn test_band_above_nyquist_bypassed() {
        let mut eq = ParamEqFilter::new( 16000.0, 1.0, 3.0 );
        eq.set_sample_rate( 22050 );
        let input = vec![ 0.3, -0.3, 0.1, -0.1 ];
        let mut output = vec![ 0.0; 4 ];
        eq.process( &input, &mut output, 1 );
        assert_eq!( output, input );
    }


    #[test]
    fn test_boost_raises_level_at_center() {
        let rate = 48000;
        let mut eq = ParamEqFilter::new( 1000.0, 1.0, 1.0 );
        eq.set_sample_rate( rate );
        let handle = eq.gain_handle();
        handle.store( 3.0f32.to_bits(), Ordering::Relaxed );

        let input: Vec<f32> = ( 0..4800 )
            .map( |i| ( 2.0 * std::f32::consts::PI * 1000.0 * i as f32 / rate as f32 ).sin() * 0.1 )
            .collect();
        let mut output = vec![ 0.0; input.len() ];
        eq.process( &input, &mut output, 1 );

        let peak_in = input[ 2400.. ].iter().fold( 0.0f32, |m, x| m.max( x.abs() ) );
        let peak_out = output[ 2400.. ].iter().fold( 0.0f32, |m, x| m.max( x.abs() ) );
        assert!( peak_out > peak_in * 2.5 );
    }
}
