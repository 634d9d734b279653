//! Audio output via cpal
//!
//! Sends decoded PCM samples to the system audio device. Every channel owns
//! one output stream; the cpal callback pulls from the channel's sample
//! queue, runs the channel's filter chain and applies its volume.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{ AtomicBool, AtomicU32, Ordering };

use cpal::traits::{ DeviceTrait, HostTrait, StreamTrait };
use parking_lot::Mutex;
use thiserror::Error;

use super::filter::FilterChain;


/// Errors that can occur with audio output.
#[derive( Debug, Error )]
pub enum OutputError {
    #[error( "No output device available" )]
    NoDevice,

    #[error( "Failed to get default stream config: {0}" )]
    StreamConfig( String ),

    #[error( "Failed to build output stream: {0}" )]
    BuildStream( String ),

    #[error( "Failed to play stream: {0}" )]
    PlayStream( String ),
}


/// Bounded queue between the decode thread and the output callback.
/// Converts between source and device channel counts on the way out.
pub struct SampleQueue {
    buffer: Mutex<VecDeque<f32>>,
    capacity: usize,
    source_channels: usize,
    output_channels: usize,
}


impl SampleQueue {
    pub fn new( capacity: usize, source_channels: u16, output_channels: u16 ) -> Self {
        Self {
            buffer: Mutex::new( VecDeque::with_capacity( capacity ) ),
            capacity,
            source_channels: source_channels.max( 1 ) as usize,
            output_channels: output_channels.max( 1 ) as usize,
        }
    }


    /// Pushes samples. Returns how many were accepted.
    pub fn push( &self, samples: &[f32] ) -> usize {
        let mut buf = self.buffer.lock();
        let available = self.capacity.saturating_sub( buf.len() );
        let to_push = samples.len().min( available );
        buf.extend( samples[ ..to_push ].iter().copied() );
        to_push
    }


    /// Fills `output` with device-layout samples, silence past the end of
    /// the queue. Returns the number of samples written from the queue.
    pub fn pop( &self, output: &mut [f32] ) -> usize {
        let mut buf = self.buffer.lock();
        let src_ch = self.source_channels;
        let out_ch = self.output_channels;

        let output_frames = output.len() / out_ch;
        let frames = output_frames.min( buf.len() / src_ch );

        for frame in 0..frames {
            let base = frame * out_ch;
            if src_ch == out_ch {
                for ch in 0..out_ch {
                    output[ base + ch ] = buf.pop_front().unwrap_or( 0.0 );
                }
            } else if src_ch == 2 && out_ch == 1 {
                let left = buf.pop_front().unwrap_or( 0.0 );
                let right = buf.pop_front().unwrap_or( 0.0 );
                output[ base ] = ( left + right ) * 0.5;
            } else {
                // Drop extra source channels, repeat the last one for extra outputs
                let mut last = 0.0;
                for ch in 0..src_ch {
                    let sample = buf.pop_front().unwrap_or( 0.0 );
                    if ch < out_ch {
                        output[ base + ch ] = sample;
                    }
                    last = sample;
                }
                for ch in src_ch..out_ch {
                    output[ base + ch ] = last;
                }
            }
        }

        let written = frames * out_ch;
        output[ written.. ].fill( 0.0 );
        written
    }


    pub fn len( &self ) -> usize {
        self.buffer.lock().len()
    }


    pub fn is_empty( &self ) -> bool {
        self.buffer.lock().is_empty()
    }


    pub fn clear( &self ) {
        self.buffer.lock().clear();
    }
}


/// State shared between a channel handle, its decode thread and the output
/// callback.
pub struct ChannelState {
    pub queue: SampleQueue,
    pub chain: Mutex<FilterChain>,
    paused: AtomicBool,
    /// f32 bits
    volume: AtomicU32,
    output_channels: usize,
}


impl ChannelState {
    pub fn new( queue: SampleQueue, output_channels: u16, paused: bool ) -> Self {
        Self {
            queue,
            chain: Mutex::new( FilterChain::default() ),
            paused: AtomicBool::new( paused ),
            volume: AtomicU32::new( 1.0_f32.to_bits() ),
            output_channels: output_channels.max( 1 ) as usize,
        }
    }


    pub fn set_paused( &self, paused: bool ) {
        self.paused.store( paused, Ordering::Relaxed );
    }


    pub fn is_paused( &self ) -> bool {
        self.paused.load( Ordering::Relaxed )
    }


    pub fn set_volume( &self, volume: f32 ) {
        self.volume.store( volume.to_bits(), Ordering::Relaxed );
    }


    pub fn volume( &self ) -> f32 {
        f32::from_bits( self.volume.load( Ordering::Relaxed ) )
    }


    /// Produces one device block. Runs on the audio thread.
    pub fn render( &self, data: &mut [f32] ) {
        if self.is_paused() {
            data.fill( 0.0 );
            return;
        }

        self.queue.pop( data );
        self.chain.lock().process( data, self.output_channels );

        let volume = self.volume();
        if volume != 1.0 {
            for sample in data.iter_mut() {
                *sample *= volume;
            }
        }
    }
}


/// Audio output handler.
/// Note: This struct is NOT Send/Sync due to cpal::Stream.
pub struct AudioOutput {
    stream: cpal::Stream,
    sample_rate: u32,
}


impl AudioOutput {
    /// Opens the default device as close as possible to the source format.
    ///
    /// Returns the output and the state its callback renders from.
    pub fn new(
        source_sample_rate: u32,
        source_channels: u16,
        paused: bool,
    ) -> Result<( Self, Arc<ChannelState> ), OutputError> {
        let host = cpal::default_host();

        let device = host
            .default_output_device()
            .ok_or( OutputError::NoDevice )?;

        tracing::info!( "Using output device: {:?}", device.name() );

        let supported_configs: Vec<_> = device
            .supported_output_configs()
            .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?
            .collect();

        let supports_rate = |c: &cpal::SupportedStreamConfigRange| {
            c.min_sample_rate().0 <= source_sample_rate && c.max_sample_rate().0 >= source_sample_rate
        };

        // Exact match first, then any layout at our rate, then the device default
        let config = if let Some( supported ) = supported_configs.iter().find( |c| {
            c.channels() == source_channels && supports_rate( c )
        }) {
            supported.clone()
                .with_sample_rate( cpal::SampleRate( source_sample_rate ) )
                .config()
        } else if let Some( supported ) = supported_configs.iter().find( |c| supports_rate( c ) ) {
            tracing::info!(
                "Channel conversion: file has {} channels, device using {} channels",
                source_channels,
                supported.channels()
            );
            supported.clone()
                .with_sample_rate( cpal::SampleRate( source_sample_rate ) )
                .config()
        } else {
            let default_config = device
                .default_output_config()
                .map_err( |e| OutputError::StreamConfig( e.to_string() ) )?;
            tracing::info!(
                "Device does not support {} Hz, resampling to {} Hz",
                source_sample_rate,
                default_config.sample_rate().0
            );
            default_config.config()
        };

        tracing::info!(
            "Audio output config: {} Hz, {} channels",
            config.sample_rate.0,
            config.channels
        );

        // About 500ms of audio
        let capacity = ( config.sample_rate.0 as usize ) * ( source_channels as usize ) / 2;
        let state = Arc::new( ChannelState::new(
            SampleQueue::new( capacity, source_channels, config.channels ),
            config.channels,
            paused,
        ));
        let callback_state = Arc::clone( &state );

        let stream = device
            .build_output_stream(
                &config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                    callback_state.render( data );
                },
                |err| {
                    tracing::error!( "Audio output error: {}", err );
                },
                None,
            )
            .map_err( |e| OutputError::BuildStream( e.to_string() ) )?;

        Ok((
            Self {
                stream,
                sample_rate: config.sample_rate.0,
            },
            state,
        ))
    }


    pub fn play( &self ) -> Result<(), OutputError> {
        self.stream
            .play()
            .map_err( |e| OutputError::PlayStream( e.to_string() ) )
    }


    /// Device sample rate.
    pub fn sample_rate( &self ) -> u32 {
        self.sample_rate
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_queue_respects_capacity() {
        let queue = SampleQueue::new( 4, 2, 2 );
        assert_eq!( queue.push( &[ 1.0; 6 ] ), 4 );
        assert_eq!( queue.len(), 4 );
    }


    #[test]
    fn test_mono_to_stereo() {
        let queue = SampleQueue::new( 16, 1, 2 );
        queue.push( &[ 0.1, 0.2 ] );
        let mut out = [ 9.0; 6 ];
        assert_eq!( queue.pop( &mut out ), 4 );
        assert_eq!( out, [ 0.1, 0.1, 0.2, 0.2, 0.0, 0.0 ] );
    }


    #[test]
    fn test_stereo_to_mono() {
        let queue = SampleQueue::new( 16, 2, 1 );
        queue.push( &[ 0.2, 0.4, 1.0, 0.0 ] );
        let mut out = [ 0.0; 2 ];
        queue.pop( &mut out );
        assert!( ( out[ 0 ] - 0.3 ).abs() < 1e-6 );
        assert!( ( out[ 1 ] - 0.5 ).abs() < 1e-6 );
    }


    #[test]
    fn test_render_paused_is_silent() {
        let state = ChannelState::new( SampleQueue::new( 16, 2, 2 ), 2, true );
        state.queue.push( &[ 0.5; 4 ] );
        let mut out = [ 1.0; 4 ];
        state.render( &mut out );
        assert_eq!( out, [ 0.0; 4 ] );
        // Nothing consumed while paused
        assert_eq!( state.queue.len(), 4 );
    }


    #[test]
    fn test_render_applies_volume() {
        let state = ChannelState::new( SampleQueue::new( 16, 2, 2 ), 2, false );
        state.set_volume( 0.5 );
        state.queue.push( &[ 0.8; 4 ] );
        let mut out = [ 0.0; 4 ];
        state.render( &mut out );
        assert_eq!( out, [ 0.4; 4 ] );
    }
}
